//! Container init: the first code that runs inside the new namespaces.
//!
//! Started by the launcher as `corral init` with the container root as its
//! working directory and the control pipe on fd 3. It isolates the mount
//! tree, switches root, mounts `/proc`, names the host, then blocks on the
//! pipe until the launcher closes it and replaces itself with the workload.

use std::convert::Infallible;
use std::path::PathBuf;

use corral_common::constants::HOSTNAME_ENV;
use corral_common::error::{CorralError, Result};

/// Runs the in-container initialization and execs the delivered command.
///
/// Only returns on failure.
///
/// # Errors
///
/// Returns an error if any mount, root switch, pipe read, lookup or
/// `execve(2)` step fails.
#[cfg(target_os = "linux")]
pub fn run_container_init() -> Result<Infallible> {
    use std::path::Path;

    use corral_core::filesystem::{mount::mount_proc, pivot_root::pivot_root};
    use corral_core::namespace::{mount::make_mounts_private, uts::set_hostname};

    ensure_in_container()?;
    let root = std::env::current_dir().map_err(|e| CorralError::io(".", e))?;
    tracing::debug!(root = %root.display(), "container init starting");

    make_mounts_private()?;
    pivot_root(&root)?;
    mount_proc(Path::new("/proc"))?;
    if let Ok(hostname) = std::env::var(HOSTNAME_ENV) {
        set_hostname(&hostname)?;
    }

    let command = parse_command(&read_control_pipe()?)?;
    let program = resolve_program(&command[0])?;
    tracing::info!(program = %program.display(), args = ?&command[1..], "executing workload");
    exec(&program, &command)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error.
#[cfg(not(target_os = "linux"))]
pub fn run_container_init() -> Result<Infallible> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Refuses to continue unless this process is the pid 1 of a fresh pid
/// namespace holding the control pipe on fd 3.
///
/// Everything after this check reshapes the mount tree of the calling
/// process, which on the host would be the host's own.
///
/// # Errors
///
/// Returns [`CorralError::Namespace`] outside a container started by
/// `corral run`.
#[cfg(target_os = "linux")]
pub fn ensure_in_container() -> Result<()> {
    use std::os::fd::BorrowedFd;

    use corral_common::constants::INIT_PIPE_FD;
    use nix::sys::stat::{SFlag, fstat};

    // SAFETY: the descriptor is only inspected, never closed, and fstat
    // reports EBADF if it is not open.
    let pipe = unsafe { BorrowedFd::borrow_raw(INIT_PIPE_FD) };
    let pipe_is_fifo = fstat(pipe).is_ok_and(|st| {
        SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits()) == SFlag::S_IFIFO
    });
    check_init_context(std::process::id(), pipe_is_fifo)
}

/// Decides whether init may run given its pid and the type of fd 3.
///
/// # Errors
///
/// Returns [`CorralError::Namespace`] unless `pid` is 1 and fd 3 is a pipe.
pub fn check_init_context(pid: u32, pipe_is_fifo: bool) -> Result<()> {
    if pid != 1 {
        return Err(CorralError::Namespace {
            message: format!(
                "corral init must only be started by corral run (running as pid {pid}, not 1)"
            ),
        });
    }
    if !pipe_is_fifo {
        return Err(CorralError::Namespace {
            message: "corral init must only be started by corral run (fd 3 is not a pipe)".into(),
        });
    }
    Ok(())
}

/// Reads the command line from the inherited control pipe until EOF.
#[cfg(target_os = "linux")]
fn read_control_pipe() -> Result<String> {
    use std::io::Read;
    use std::os::fd::FromRawFd;

    use corral_common::constants::INIT_PIPE_FD;

    // SAFETY: the launcher installs the pipe read end as fd 3 and nothing
    // else in this process owns it.
    let mut pipe = unsafe { std::fs::File::from_raw_fd(INIT_PIPE_FD) };
    let mut text = String::new();
    let _ = pipe
        .read_to_string(&mut text)
        .map_err(|e| CorralError::Namespace {
            message: format!("reading command from fd {INIT_PIPE_FD} failed: {e}"),
        })?;
    Ok(text)
}

/// Splits a delivered command line into program and arguments.
///
/// # Errors
///
/// Returns [`CorralError::Namespace`] if the line holds no command.
pub fn parse_command(line: &str) -> Result<Vec<String>> {
    let parts: Vec<String> = line.split_whitespace().map(ToString::to_string).collect();
    if parts.is_empty() {
        return Err(CorralError::Namespace {
            message: "container init received an empty command".into(),
        });
    }
    Ok(parts)
}

/// Resolves a program name the way a shell does: paths are taken as given,
/// bare names are looked up on `PATH`.
///
/// # Errors
///
/// Returns [`CorralError::NotFound`] if a bare name is not on `PATH`.
pub fn resolve_program(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        return Ok(PathBuf::from(name));
    }
    which::which(name).map_err(|_| CorralError::NotFound {
        kind: "program",
        id: name.to_string(),
    })
}

#[cfg(target_os = "linux")]
fn exec(program: &std::path::Path, argv: &[String]) -> Result<Infallible> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let encode = |bytes: &[u8]| {
        CString::new(bytes).map_err(|e| CorralError::Namespace {
            message: format!("argument contains a NUL byte: {e}"),
        })
    };
    let path = encode(program.as_os_str().as_bytes())?;
    let args = argv
        .iter()
        .map(|a| encode(a.as_bytes()))
        .collect::<Result<Vec<_>>>()?;
    let env = std::env::vars_os()
        .filter(|(k, _)| k.as_bytes() != HOSTNAME_ENV.as_bytes())
        .map(|(k, v)| encode(&[k.as_bytes(), b"=", v.as_bytes()].concat()))
        .collect::<Result<Vec<_>>>()?;

    nix::unistd::execve(&path, &args, &env).map_err(|e| CorralError::Namespace {
        message: format!("execve({}) failed: {e}", program.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_runs_only_as_pid_one_with_a_pipe() {
        check_init_context(1, true).unwrap();
        assert!(matches!(
            check_init_context(4242, true),
            Err(CorralError::Namespace { .. })
        ));
        assert!(matches!(
            check_init_context(1, false),
            Err(CorralError::Namespace { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn init_refuses_to_run_on_the_host() {
        let err = ensure_in_container().unwrap_err();
        assert!(err.to_string().contains("corral run"));
        let err = run_container_init().unwrap_err();
        assert!(err.to_string().contains("corral run"));
    }

    #[test]
    fn command_line_is_split_on_whitespace() {
        assert_eq!(
            parse_command("  /bin/sh -c   top\n").unwrap(),
            vec!["/bin/sh", "-c", "top"]
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(parse_command("").is_err());
        assert!(parse_command(" \n\t").is_err());
    }

    #[test]
    fn explicit_paths_are_not_searched() {
        assert_eq!(
            resolve_program("./run.sh").unwrap(),
            PathBuf::from("./run.sh")
        );
        assert_eq!(
            resolve_program("/opt/app/bin/server").unwrap(),
            PathBuf::from("/opt/app/bin/server")
        );
    }

    #[cfg(unix)]
    #[test]
    fn bare_names_are_found_on_path() {
        assert!(resolve_program("sh").unwrap().is_absolute());
        assert!(matches!(
            resolve_program("corral-no-such-program"),
            Err(CorralError::NotFound { kind: "program", .. })
        ));
    }
}
