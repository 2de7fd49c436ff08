//! External command execution for link and firewall configuration.
//!
//! The bridge driver drives `ip`, `iptables` and `nsenter`. Routing those
//! invocations through [`CommandRunner`] lets the driver logic be exercised
//! without touching the host network.

use std::process::Command;

use corral_common::error::{CorralError, Result};

/// Runs one external program to completion.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NetworkConfig`] if the program cannot be
    /// started or exits unsuccessfully.
    fn run(&self, program: &str, args: &[&str]) -> Result<()>;
}

/// Runs commands on the host, resolving programs through `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let binary = which::which(program)
            .map_err(|e| CorralError::network(format!("{program} not available: {e}")))?;
        tracing::debug!(program, args = %args.join(" "), "running");

        let output = Command::new(&binary)
            .args(args)
            .output()
            .map_err(|e| CorralError::network(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CorralError::network(format!(
                "{program} {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_is_a_network_error() {
        let err = SystemRunner
            .run("corral-definitely-not-installed", &[])
            .unwrap_err();
        assert!(matches!(err, CorralError::NetworkConfig { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_is_checked() {
        SystemRunner.run("true", &[]).unwrap();
        assert!(SystemRunner.run("false", &[]).is_err());
    }
}
