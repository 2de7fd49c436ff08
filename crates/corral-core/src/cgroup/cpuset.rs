//! CPU pinning via the cpuset controller.

use std::path::Path;

use corral_common::error::Result;

use super::{resource_error, write_control};

/// Restricts a cgroup to the given CPU list (e.g. `0-1` or `0,2`).
///
/// # Errors
///
/// Returns an error if writing `cpuset.cpus` fails.
pub fn set_cpus(cgroup_path: &Path, cpus: &str) -> Result<()> {
    write_control(cgroup_path, "cpuset.cpus", cpus)?;
    tracing::debug!(cpus, "cpuset set");
    Ok(())
}

/// Files a v1 cpuset group must have filled before it accepts tasks or
/// child limits.
const INHERITED: [&str; 2] = ["cpuset.cpus", "cpuset.mems"];

/// Copies `cpuset.cpus` and `cpuset.mems` down from the hierarchy root to
/// every level of `group` whose own value is empty.
///
/// A fresh v1 cpuset group starts with both files empty. Until they are
/// filled it rejects new tasks, and a child cannot be given CPUs its
/// parent lacks.
///
/// # Errors
///
/// Returns an error if a level cannot be created or written.
pub fn inherit_parent(mount_point: &Path, group: &Path) -> Result<()> {
    for file in INHERITED {
        inherit_file(mount_point, group, file)?;
    }
    Ok(())
}

fn inherit_file(mount_point: &Path, group: &Path, file: &str) -> Result<()> {
    let Ok(mut inherited) = std::fs::read_to_string(mount_point.join(file)) else {
        return Ok(());
    };

    let mut dir = mount_point.to_path_buf();
    for component in group.components() {
        dir.push(component);
        std::fs::create_dir_all(&dir).map_err(|e| resource_error(&dir, &e))?;
        let own = std::fs::read_to_string(dir.join(file)).unwrap_or_default();
        if own.trim().is_empty() {
            write_control(&dir, file, inherited.trim())?;
        } else {
            inherited = own;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn cpus_and_mems_are_inherited_by_each_level() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("cpuset.cpus"), "0-3\n").unwrap();
        std::fs::write(root.path().join("cpuset.mems"), "0\n").unwrap();

        inherit_parent(root.path(), Path::new("corral/c1")).unwrap();

        assert_eq!(read(&root.path().join("corral/cpuset.cpus")), "0-3");
        assert_eq!(read(&root.path().join("corral/cpuset.mems")), "0");
        assert_eq!(read(&root.path().join("corral/c1/cpuset.cpus")), "0-3");
        assert_eq!(read(&root.path().join("corral/c1/cpuset.mems")), "0");
    }

    #[test]
    fn existing_mems_are_kept() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("cpuset.mems"), "0-1").unwrap();
        std::fs::create_dir_all(root.path().join("corral")).unwrap();
        std::fs::write(root.path().join("corral/cpuset.mems"), "1").unwrap();

        inherit_parent(root.path(), Path::new("corral/c2")).unwrap();

        assert_eq!(read(&root.path().join("corral/c2/cpuset.mems")), "1");
    }

    #[test]
    fn missing_root_files_are_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        inherit_parent(root.path(), Path::new("corral/c3")).unwrap();
        assert!(!root.path().join("corral").exists());
    }
}
