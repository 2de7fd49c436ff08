//! `corral init`: Container-side init, started inside the new namespaces.

use std::process::ExitCode;

use anyhow::Context;
use corral_runtime::init::run_container_init;

/// Executes the `init` command.
///
/// On success the process image is replaced by the container workload and
/// this function never returns.
///
/// # Errors
///
/// Returns an error if any init step fails before the workload is executed.
pub fn execute() -> anyhow::Result<ExitCode> {
    let never = run_container_init().context("container init failed")?;
    match never {}
}

#[cfg(test)]
mod tests {
    #[cfg(target_os = "linux")]
    #[test]
    fn init_outside_a_container_fails_without_side_effects() {
        let err = super::execute().unwrap_err();
        assert!(format!("{err:#}").contains("corral run"));
    }
}
