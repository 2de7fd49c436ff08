//! Process spawning inside isolated namespaces.
//!
//! The child is created with `clone(2)` so the requested namespaces exist
//! before any of its code runs. Between clone and `execve(2)` the child only
//! rewires descriptors and changes directory; everything it needs is
//! prepared by the parent beforehand.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use corral_common::error::{CorralError, Result};
use corral_core::namespace::NamespaceConfig;

/// Stack size handed to the cloned child until it execs.
#[cfg(target_os = "linux")]
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// How long [`kill`] waits for a process it does not own to disappear.
#[cfg(target_os = "linux")]
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code of a child that failed before reaching `execve`.
#[cfg(target_os = "linux")]
const EXEC_FAILED: isize = 127;

/// Where the child's standard streams go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioMode {
    /// Share the caller's stdin, stdout and stderr.
    Inherit,
    /// Read stdin from `/dev/null` and append stdout and stderr to a file.
    Redirect(PathBuf),
}

/// Everything needed to start one isolated process.
#[derive(Debug)]
pub struct ProcessSpawnOptions {
    /// Namespaces the child is created in.
    pub namespaces: NamespaceConfig,
    /// Absolute path of the program to execute.
    pub program: PathBuf,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Descriptor passed to the child as fd 3; closed in the parent once
    /// the child has started.
    pub extra_fd: Option<OwnedFd>,
    /// Directory the child changes into before exec.
    pub working_dir: PathBuf,
    /// Variables added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Standard stream wiring.
    pub stdio: StdioMode,
}

impl ProcessSpawnOptions {
    /// Options for running `program` with every default namespace, the
    /// caller's streams and the current directory.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            namespaces: NamespaceConfig::default(),
            program: program.into(),
            args: Vec::new(),
            extra_fd: None,
            working_dir: PathBuf::from("."),
            env: Vec::new(),
            stdio: StdioMode::Inherit,
        }
    }
}

/// Starts a process as described by `options` and returns its host pid.
///
/// # Errors
///
/// Returns [`CorralError::Namespace`] if the program path cannot be encoded
/// or `clone(2)` fails, or an I/O error if the log file cannot be opened.
#[cfg(target_os = "linux")]
pub fn spawn_isolated(options: ProcessSpawnOptions) -> Result<u32> {
    use std::ffi::CString;
    use std::os::fd::AsRawFd;
    use std::os::unix::ffi::OsStrExt;

    let cstring = |bytes: &[u8]| {
        CString::new(bytes).map_err(|e| CorralError::Namespace {
            message: format!("argument contains a NUL byte: {e}"),
        })
    };

    let program = cstring(options.program.as_os_str().as_bytes())?;
    let mut argv = vec![program.clone()];
    for arg in &options.args {
        argv.push(cstring(arg.as_bytes())?);
    }
    let mut envp = Vec::new();
    for (key, value) in std::env::vars_os() {
        if options.env.iter().any(|(k, _)| k.as_bytes() == key.as_bytes()) {
            continue;
        }
        let mut pair = key.as_bytes().to_vec();
        pair.push(b'=');
        pair.extend_from_slice(value.as_bytes());
        envp.push(cstring(&pair)?);
    }
    for (key, value) in &options.env {
        envp.push(cstring(format!("{key}={value}").as_bytes())?);
    }
    let working_dir = cstring(options.working_dir.as_os_str().as_bytes())?;
    let argv_ptrs = null_terminated(&argv);
    let envp_ptrs = null_terminated(&envp);

    let redirect = match &options.stdio {
        StdioMode::Inherit => None,
        StdioMode::Redirect(log) => Some(open_redirect(log)?),
    };
    let stdio_fds = redirect
        .as_ref()
        .map(|(null, log)| (null.as_raw_fd(), log.as_raw_fd()));
    let extra_fd = options.extra_fd.as_ref().map(AsRawFd::as_raw_fd);

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let child = Box::new(|| {
        // SAFETY: runs in the freshly cloned child, which has its own copy
        // of the address space; the pointer arrays point into `argv` and
        // `envp`, which the parent keeps alive across the clone.
        unsafe {
            exec_child(
                stdio_fds,
                extra_fd,
                &working_dir,
                &program,
                &argv_ptrs,
                &envp_ptrs,
            )
        }
    });

    let flags = options.namespaces.clone_flags();
    // SAFETY: the child does not share memory with the parent (no
    // CLONE_VM) and the stack outlives the call.
    let pid = unsafe { nix::sched::clone(child, &mut stack, flags, Some(libc::SIGCHLD)) }
        .map_err(|e| CorralError::Namespace {
            message: format!("clone({}) failed: {e}", options.program.display()),
        })?;

    let pid = u32::try_from(pid.as_raw()).map_err(|_| CorralError::Namespace {
        message: format!("clone returned invalid pid {pid}"),
    })?;
    tracing::info!(pid, program = %options.program.display(), "isolated process started");
    Ok(pid)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn spawn_isolated(_options: ProcessSpawnOptions) -> Result<u32> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

#[cfg(target_os = "linux")]
fn open_redirect(log: &Path) -> Result<(OwnedFd, OwnedFd)> {
    if let Some(parent) = log.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CorralError::io(parent, e))?;
    }
    let null = std::fs::File::open("/dev/null").map_err(|e| CorralError::io("/dev/null", e))?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .map_err(|e| CorralError::io(log, e))?;
    Ok((null.into(), file.into()))
}

/// Builds the NULL-terminated pointer array `execve(2)` expects.
#[cfg(target_os = "linux")]
fn null_terminated(strings: &[std::ffi::CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Child side of [`spawn_isolated`]: wire descriptors, chdir, exec.
///
/// Does not allocate: `clone(2)` skips the allocator's fork handlers.
/// Returns only if a step fails.
///
/// # Safety
///
/// Must only be called in a child created by `clone(2)` without `CLONE_VM`,
/// with `argv` and `envp` NULL-terminated arrays of valid C strings.
#[cfg(target_os = "linux")]
unsafe fn exec_child(
    stdio: Option<(i32, i32)>,
    extra_fd: Option<i32>,
    working_dir: &std::ffi::CStr,
    program: &std::ffi::CStr,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> isize {
    use corral_common::constants::INIT_PIPE_FD;

    // SAFETY: plain descriptor syscalls on descriptors owned by this process.
    unsafe {
        if let Some((null, log)) = stdio {
            if libc::dup2(null, libc::STDIN_FILENO) < 0
                || libc::dup2(log, libc::STDOUT_FILENO) < 0
                || libc::dup2(log, libc::STDERR_FILENO) < 0
            {
                return EXEC_FAILED;
            }
        }
        if let Some(fd) = extra_fd {
            let wired = if fd == INIT_PIPE_FD {
                libc::fcntl(fd, libc::F_SETFD, 0)
            } else {
                libc::dup2(fd, INIT_PIPE_FD)
            };
            if wired < 0 {
                return EXEC_FAILED;
            }
        }
        if libc::chdir(working_dir.as_ptr()) < 0 {
            return EXEC_FAILED;
        }
        let _ = libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    EXEC_FAILED
}

/// Blocks until `pid` exits and returns its exit code.
///
/// A process killed by a signal reports `128 + signal`, as a shell does.
///
/// # Errors
///
/// Returns [`CorralError::Namespace`] if `pid` is not a child of this process.
#[cfg(target_os = "linux")]
pub fn wait_for_exit(pid: u32) -> Result<i32> {
    use nix::errno::Errno;
    use nix::sys::wait::{WaitStatus, waitpid};

    let target = to_pid(pid)?;
    loop {
        match waitpid(target, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                tracing::debug!(pid, code, "process exited");
                return Ok(code);
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                tracing::debug!(pid, signal = %signal, "process killed");
                return Ok(128 + signal as i32);
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(CorralError::Namespace {
                    message: format!("waitpid({pid}) failed: {e}"),
                });
            }
        }
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error.
#[cfg(not(target_os = "linux"))]
pub fn wait_for_exit(_pid: u32) -> Result<i32> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Returns `true` while `pid` exists and has not exited.
///
/// A zombie waiting to be reaped counts as exited.
#[cfg(target_os = "linux")]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    to_pid(pid).is_ok_and(|p| nix::sys::signal::kill(p, None).is_ok()) && !is_zombie(pid)
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub const fn is_alive(_pid: u32) -> bool {
    false
}

/// Sends `SIGTERM`, waits up to `grace` for the process to go away, then
/// kills it with [`kill`].
///
/// A process that is already gone is not an error.
///
/// # Errors
///
/// Returns [`CorralError::Namespace`] if the process cannot be signalled or
/// does not exit after `SIGKILL`.
#[cfg(target_os = "linux")]
pub fn terminate(pid: u32, grace: Duration) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::Signal;

    const POLL: Duration = Duration::from_millis(50);

    let target = to_pid(pid)?;
    match nix::sys::signal::kill(target, Signal::SIGTERM) {
        Ok(()) => tracing::info!(pid, "sent SIGTERM"),
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => {
            return Err(CorralError::Namespace {
                message: format!("kill({pid}, SIGTERM) failed: {e}"),
            });
        }
    }

    let mut waited = Duration::ZERO;
    while waited < grace {
        reap(target);
        if !is_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(POLL);
        waited += POLL;
    }
    kill(pid)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error.
#[cfg(not(target_os = "linux"))]
pub fn terminate(_pid: u32, _grace: Duration) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Sends `SIGKILL` and returns once the process has exited.
///
/// Our own children are reaped; for any other process this polls until it
/// is gone or a zombie.
///
/// # Errors
///
/// Returns [`CorralError::Namespace`] if the process cannot be signalled or
/// is still running after [`KILL_TIMEOUT`].
#[cfg(target_os = "linux")]
pub fn kill(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::Signal;
    use nix::sys::wait::waitpid;

    const POLL: Duration = Duration::from_millis(10);

    let target = to_pid(pid)?;
    match nix::sys::signal::kill(target, Signal::SIGKILL) {
        Ok(()) => tracing::info!(pid, "sent SIGKILL"),
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => {
            return Err(CorralError::Namespace {
                message: format!("kill({pid}, SIGKILL) failed: {e}"),
            });
        }
    }

    loop {
        match waitpid(target, None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => break,
            Err(e) => {
                return Err(CorralError::Namespace {
                    message: format!("waitpid({pid}) failed: {e}"),
                });
            }
        }
    }

    let mut waited = Duration::ZERO;
    while is_alive(pid) {
        if waited >= KILL_TIMEOUT {
            return Err(CorralError::Namespace {
                message: format!("process {pid} still running after SIGKILL"),
            });
        }
        std::thread::sleep(POLL);
        waited += POLL;
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error.
#[cfg(not(target_os = "linux"))]
pub fn kill(_pid: u32) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Collects the exit status if `pid` is our child and has exited.
#[cfg(target_os = "linux")]
fn reap(pid: nix::unistd::Pid) {
    use nix::sys::wait::{WaitPidFlag, waitpid};

    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
}

/// Reads the state letter from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z")
    })
}

#[cfg(target_os = "linux")]
fn to_pid(pid: u32) -> Result<nix::unistd::Pid> {
    i32::try_from(pid)
        .map(nix::unistd::Pid::from_raw)
        .map_err(|_| CorralError::Namespace {
            message: format!("pid {pid} out of range"),
        })
}
