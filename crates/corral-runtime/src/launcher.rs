//! Launching the container init process.
//!
//! The launcher prepares the workspace, opens the control pipe and
//! re-executes the engine binary as `init` inside fresh namespaces. The
//! returned [`ContainerHandle`] keeps the write end of the pipe; init
//! execs the workload only once that end is closed.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use corral_common::constants::{HOSTNAME_ENV, INIT_SUBCOMMAND};
use corral_common::error::{CorralError, Result};
use corral_common::types::ContainerId;
use corral_core::namespace::NamespaceConfig;

use crate::logs::log_path;
use crate::process::{ProcessSpawnOptions, StdioMode, spawn_isolated};
use crate::workspace::{Volume, WorkspaceProvider};

/// A launched container whose workload has not necessarily started yet.
#[derive(Debug)]
pub struct ContainerHandle {
    /// Container identifier.
    pub id: ContainerId,
    /// Host pid of the container init process.
    pub pid: u32,
    /// Root filesystem the init process pivots into.
    pub root_path: PathBuf,
    control: Option<File>,
}

impl ContainerHandle {
    /// Writes the command line to the init process.
    ///
    /// The pipe stays open; the workload starts after
    /// [`ContainerHandle::close_control`].
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Namespace`] if the command is empty, was
    /// already delivered, or cannot be written.
    pub fn send_command(&mut self, command: &[String]) -> Result<()> {
        if command.is_empty() {
            return Err(CorralError::Namespace {
                message: "no command given".into(),
            });
        }
        let pipe = self.control.as_mut().ok_or_else(|| CorralError::Namespace {
            message: format!("control pipe of {} already closed", self.id),
        })?;
        let line = command.join(" ");
        pipe.write_all(line.as_bytes())
            .map_err(|e| CorralError::Namespace {
                message: format!("sending command to {} failed: {e}", self.id),
            })?;
        tracing::debug!(id = %self.id, command = %line, "command delivered");
        Ok(())
    }

    /// Closes the control pipe, releasing the init process to exec.
    pub fn close_control(&mut self) {
        if self.control.take().is_some() {
            tracing::debug!(id = %self.id, "control pipe closed");
        }
    }
}

/// Starts container init processes.
pub struct Launcher {
    workspace: Box<dyn WorkspaceProvider>,
    namespaces: NamespaceConfig,
    init_program: PathBuf,
    init_args: Vec<String>,
    log_dir: PathBuf,
}

impl Launcher {
    /// Creates a launcher that re-executes the running binary as `init`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Namespace`] if the running executable cannot
    /// be resolved.
    pub fn new(workspace: Box<dyn WorkspaceProvider>, log_dir: impl Into<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| CorralError::Namespace {
            message: format!("cannot resolve own executable: {e}"),
        })?;
        Ok(Self::with_init(
            workspace,
            log_dir,
            exe,
            vec![INIT_SUBCOMMAND.to_string()],
        ))
    }

    /// Creates a launcher that starts `program args...` as the init process.
    #[must_use]
    pub fn with_init(
        workspace: Box<dyn WorkspaceProvider>,
        log_dir: impl Into<PathBuf>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
    ) -> Self {
        Self {
            workspace,
            namespaces: NamespaceConfig::default(),
            init_program: program.into(),
            init_args: args,
            log_dir: log_dir.into(),
        }
    }

    /// Replaces the namespace set new containers are created in.
    #[must_use]
    pub fn namespaces(mut self, namespaces: NamespaceConfig) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Returns the workspace provider.
    #[must_use]
    pub fn workspace(&self) -> &dyn WorkspaceProvider {
        self.workspace.as_ref()
    }

    /// Prepares the workspace and starts the init process of container `id`.
    ///
    /// Interactive containers share the caller's terminal; detached ones
    /// write to `<log_dir>/<id>.log`. The caller is never blocked on the
    /// child here.
    ///
    /// # Errors
    ///
    /// Returns the workspace error if preparation fails (no process is
    /// started), or [`CorralError::Namespace`] if the pipe or the process
    /// cannot be created (the workspace is torn down again).
    pub fn launch(
        &self,
        interactive: bool,
        image: &str,
        id: &ContainerId,
        volume: Option<&Volume>,
    ) -> Result<ContainerHandle> {
        let root_path = self.workspace.prepare(image, id.as_str(), volume)?;
        match self.spawn_init(interactive, id, &root_path) {
            Ok((pid, control)) => Ok(ContainerHandle {
                id: id.clone(),
                pid,
                root_path,
                control: Some(control),
            }),
            Err(e) => {
                if let Err(cleanup) = self.workspace.teardown(id.as_str(), volume) {
                    tracing::warn!(id = %id, error = %cleanup, "workspace teardown failed");
                }
                Err(e)
            }
        }
    }

    fn spawn_init(&self, interactive: bool, id: &ContainerId, root: &Path) -> Result<(u32, File)> {
        let (read, write) = control_pipe()?;

        let mut options = ProcessSpawnOptions::new(&self.init_program);
        options.namespaces = self.namespaces.clone();
        options.args.clone_from(&self.init_args);
        options.extra_fd = Some(read);
        options.working_dir = root.to_path_buf();
        options.env = vec![(HOSTNAME_ENV.to_string(), id.to_string())];
        options.stdio = if interactive {
            StdioMode::Inherit
        } else {
            StdioMode::Redirect(log_path(&self.log_dir, id.as_str()))
        };

        // The read end is closed in this process when `options` is dropped.
        let pid = spawn_isolated(options)?;
        tracing::info!(id = %id, pid, interactive, "container init started");
        Ok((pid, File::from(write)))
    }
}

#[cfg(target_os = "linux")]
fn control_pipe() -> Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(|e| CorralError::Namespace {
        message: format!("control pipe creation failed: {e}"),
    })
}

#[cfg(not(target_os = "linux"))]
fn control_pipe() -> Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}
