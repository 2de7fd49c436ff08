//! Cgroup resource management.
//!
//! A container gets one group directory per enabled subsystem: under each
//! controller's own mount point on a legacy (v1) host, or a single directory
//! in the unified (v2) hierarchy. Limits are written before the container
//! process is placed in the group, and the directories are removed once the
//! process has exited.

pub mod cpu;
pub mod cpuset;
pub mod memory;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};
use corral_common::types::ResourceLimits;

/// Cgroup filesystem layout of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// One hierarchy per controller, membership through `tasks`.
    V1,
    /// Single unified hierarchy, membership through `cgroup.procs`.
    V2,
}

/// Resource axis the engine can constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// Memory cap.
    Memory,
    /// Relative CPU weight.
    Cpu,
    /// CPU core pinning.
    Cpuset,
}

impl Subsystem {
    /// Every subsystem, in the order limits are applied.
    pub const ALL: [Self; 3] = [Self::Memory, Self::Cpu, Self::Cpuset];

    /// Kernel controller name.
    #[must_use]
    pub const fn controller(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Cpuset => "cpuset",
        }
    }

    fn requested(self, limits: &ResourceLimits) -> Option<&str> {
        match self {
            Self::Memory => limits.memory_limit.as_deref(),
            Self::Cpu => limits.cpu_share.as_deref(),
            Self::Cpuset => limits.cpu_set.as_deref(),
        }
    }
}

/// Where each subsystem is mounted.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    version: CgroupVersion,
    mounts: HashMap<Subsystem, PathBuf>,
}

impl Hierarchy {
    /// A unified hierarchy mounted at `root`.
    #[must_use]
    pub fn unified(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            version: CgroupVersion::V2,
            mounts: Subsystem::ALL
                .iter()
                .map(|s| (*s, root.to_path_buf()))
                .collect(),
        }
    }

    /// A legacy hierarchy with each controller mounted at `root/<controller>`.
    #[must_use]
    pub fn legacy(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            version: CgroupVersion::V1,
            mounts: Subsystem::ALL
                .iter()
                .map(|s| (*s, root.join(s.controller())))
                .collect(),
        }
    }

    /// Detects the layout of the cgroup filesystem mounted at `root`.
    ///
    /// A `cgroup.controllers` file at the root means a unified hierarchy.
    /// Otherwise the v1 mount point of each controller is looked up in
    /// `/proc/self/mountinfo`, falling back to `root/<controller>`.
    #[must_use]
    pub fn detect(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        if root.join("cgroup.controllers").exists() {
            tracing::debug!(root = %root.display(), "unified cgroup hierarchy detected");
            return Self::unified(root);
        }

        let mut hierarchy = Self::legacy(root);
        if let Ok(mountinfo) = std::fs::read_to_string("/proc/self/mountinfo") {
            for subsystem in Subsystem::ALL {
                if let Some(mount) = find_v1_mount(&mountinfo, subsystem.controller()) {
                    let _ = hierarchy.mounts.insert(subsystem, mount);
                }
            }
        }
        tracing::debug!(mounts = ?hierarchy.mounts, "legacy cgroup hierarchy detected");
        hierarchy
    }

    /// Returns the mount point of a subsystem.
    #[must_use]
    pub fn mount_point(&self, subsystem: Subsystem) -> &Path {
        &self.mounts[&subsystem]
    }

    fn procs_file(&self) -> &'static str {
        match self.version {
            CgroupVersion::V1 => "tasks",
            CgroupVersion::V2 => "cgroup.procs",
        }
    }
}

/// Finds the mount point of a v1 controller in `/proc/self/mountinfo` text.
///
/// A line looks like
/// `36 25 0:31 / /sys/fs/cgroup/memory rw,nosuid - cgroup cgroup rw,memory`;
/// the controller list is in the super options after the ` - ` separator.
#[must_use]
pub fn find_v1_mount(mountinfo: &str, controller: &str) -> Option<PathBuf> {
    mountinfo.lines().find_map(|line| {
        let (mount_fields, fs_fields) = line.split_once(" - ")?;
        let mut fs = fs_fields.split_whitespace();
        if fs.next()? != "cgroup" {
            return None;
        }
        let super_opts = fs.nth(1)?;
        if !super_opts.split(',').any(|opt| opt == controller) {
            return None;
        }
        mount_fields.split_whitespace().nth(4).map(PathBuf::from)
    })
}

/// Handle to the cgroup of one container.
#[derive(Debug)]
pub struct CgroupManager {
    hierarchy: Hierarchy,
    /// Group path relative to each subsystem mount point.
    group: PathBuf,
    /// Subsystem directories holding a limit for this container.
    applied: Vec<(Subsystem, PathBuf)>,
}

impl CgroupManager {
    /// Creates a manager for `group` (e.g. `corral/<id>`) in `hierarchy`.
    ///
    /// Nothing is created on disk until [`CgroupManager::apply_limits`].
    #[must_use]
    pub fn new(hierarchy: Hierarchy, group: impl Into<PathBuf>) -> Self {
        Self {
            hierarchy,
            group: group.into(),
            applied: Vec::new(),
        }
    }

    /// Returns the group directory of a subsystem.
    #[must_use]
    pub fn subsystem_path(&self, subsystem: Subsystem) -> PathBuf {
        self.hierarchy.mount_point(subsystem).join(&self.group)
    }

    /// Creates the group directories and writes every configured limit.
    ///
    /// An axis without a value is left unconstrained and gets no directory.
    /// If any write fails, directories created by this call are removed
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Resource`] if a directory or control file
    /// cannot be created or written.
    pub fn apply_limits(&mut self, limits: &ResourceLimits) -> Result<()> {
        let mut created = Vec::new();
        for subsystem in Subsystem::ALL {
            let Some(value) = subsystem.requested(limits) else {
                continue;
            };
            if let Err(e) = self.apply_one(subsystem, value, &mut created) {
                self.rollback(&created);
                return Err(e);
            }
        }
        tracing::info!(
            group = %self.group.display(),
            subsystems = self.applied.len(),
            "cgroup limits applied"
        );
        Ok(())
    }

    fn apply_one(
        &mut self,
        subsystem: Subsystem,
        value: &str,
        created: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let dir = self.subsystem_path(subsystem);
        if !dir.exists() {
            if self.hierarchy.version == CgroupVersion::V2 {
                enable_controller(self.hierarchy.mount_point(subsystem), &self.group, subsystem);
            }
            std::fs::create_dir_all(&dir).map_err(|e| resource_error(&dir, &e))?;
            created.push(dir.clone());
        }
        let version = self.hierarchy.version;
        match subsystem {
            Subsystem::Memory => memory::set_memory_limit(&dir, version, value)?,
            Subsystem::Cpu => cpu::set_cpu_share(&dir, version, value)?,
            Subsystem::Cpuset => {
                if version == CgroupVersion::V1 {
                    cpuset::inherit_parent(self.hierarchy.mount_point(subsystem), &self.group)?;
                }
                cpuset::set_cpus(&dir, value)?;
            }
        }
        if !self.applied.iter().any(|(_, d)| *d == dir) {
            self.applied.push((subsystem, dir));
        }
        Ok(())
    }

    fn rollback(&mut self, created: &[PathBuf]) {
        for dir in created.iter().rev() {
            if let Err(e) = std::fs::remove_dir(dir) {
                tracing::warn!(path = %dir.display(), error = %e, "failed to remove partial cgroup");
            }
        }
        self.applied.retain(|(_, d)| !created.contains(d));
    }

    /// Places a process in every group directory created by
    /// [`CgroupManager::apply_limits`].
    ///
    /// With no limits applied this is a no-op and the process stays in its
    /// parent's cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Resource`] if writing the membership file fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        let procs = self.hierarchy.procs_file();
        for (subsystem, dir) in &self.applied {
            let file = dir.join(procs);
            std::fs::write(&file, pid.to_string()).map_err(|e| resource_error(&file, &e))?;
            tracing::debug!(pid, subsystem = subsystem.controller(), "added process to cgroup");
        }
        Ok(())
    }

    /// Removes every group directory of this container.
    ///
    /// The kernel refuses to remove a group that still has members, so this
    /// must run after the container process has exited. Every directory is
    /// attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Resource`] if a directory cannot be removed.
    pub fn remove(&self) -> Result<()> {
        let mut dirs: Vec<PathBuf> = Subsystem::ALL
            .iter()
            .map(|s| self.subsystem_path(*s))
            .collect();
        dirs.dedup();

        let mut first_error = None;
        for dir in dirs.iter().filter(|d| d.exists()) {
            match std::fs::remove_dir(dir) {
                Ok(()) => tracing::debug!(path = %dir.display(), "cgroup removed"),
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "cgroup removal failed");
                    if first_error.is_none() {
                        first_error = Some(resource_error(dir, &e));
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Writes a single control file, mapping failures to a resource error.
pub(crate) fn write_control(dir: &Path, file: &str, value: &str) -> Result<()> {
    let path = dir.join(file);
    std::fs::write(&path, value).map_err(|e| resource_error(&path, &e))?;
    tracing::debug!(path = %path.display(), value, "cgroup control written");
    Ok(())
}

pub(crate) fn resource_error(path: &Path, e: &std::io::Error) -> CorralError {
    CorralError::Resource {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Enables a controller for the children of every ancestor of `group`.
///
/// Failures are only logged: an unavailable controller surfaces as a missing
/// control file when the limit is written.
fn enable_controller(root: &Path, group: &Path, subsystem: Subsystem) {
    let token = format!("+{}", subsystem.controller());
    let mut dirs = vec![root.to_path_buf()];
    if let Some(parent) = group.parent() {
        let mut dir = root.to_path_buf();
        for component in parent.components() {
            dir.push(component);
            dirs.push(dir.clone());
        }
    }

    for dir in dirs {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::debug!(path = %dir.display(), error = %e, "cgroup parent not created");
            continue;
        }
        let control = dir.join("cgroup.subtree_control");
        if !control.exists() {
            continue;
        }
        if let Err(e) = std::fs::write(&control, &token) {
            tracing::debug!(path = %control.display(), error = %e, "controller not enabled");
        }
    }
}
