//! Runtime engine that orchestrates container lifecycle.
//!
//! A run goes launch, apply limits, join cgroup, deliver command, connect
//! network, record, release. The workload only starts at the final release
//! of the control pipe, so everything before it is in place by then. Any
//! failure before the release tears down what was already built.

use std::time::Duration;

use corral_common::config::CorralConfig;
use corral_common::error::{CorralError, Result};
use corral_common::types::{ContainerId, ContainerState, ResourceLimits};
use corral_core::cgroup::{CgroupManager, Hierarchy};
use corral_network::{Endpoint, NetworkManager, PortMapping};

use crate::launcher::{ContainerHandle, Launcher};
use crate::logs::read_logs;
use crate::process::{is_alive, kill, terminate, wait_for_exit};
use crate::state::{ContainerRecord, StateStore};
use crate::workspace::{OverlayWorkspace, Volume};

/// Time a container gets between `SIGTERM` and `SIGKILL` on stop.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// What to run and how.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Share the caller's terminal and wait for the workload to exit.
    pub interactive: bool,
    /// Image name under the image directory.
    pub image: String,
    /// Program and arguments.
    pub command: Vec<String>,
    /// Cgroup limits.
    pub limits: ResourceLimits,
    /// Host directory to bind into the container.
    pub volume: Option<Volume>,
    /// Network to join.
    pub network: Option<String>,
    /// Host ports forwarded to the container; requires a network.
    pub ports: Vec<PortMapping>,
}

/// Result of [`Engine::run`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Container identifier.
    pub id: ContainerId,
    /// Host pid of the container init process.
    pub pid: u32,
    /// Workload exit code; only known for interactive runs.
    pub exit_code: Option<i32>,
    /// Network endpoint, if the container joined a network.
    pub endpoint: Option<Endpoint>,
}

/// The runtime engine that coordinates all container operations.
pub struct Engine {
    config: CorralConfig,
    launcher: Launcher,
    hierarchy: Hierarchy,
    networks: NetworkManager,
    state: StateStore,
}

impl Engine {
    /// Creates an engine for the host, with paths taken from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the running executable cannot be resolved or
    /// the network records cannot be loaded.
    pub fn new(config: CorralConfig) -> Result<Self> {
        let launcher = Launcher::new(Box::new(OverlayWorkspace::new(&config)), &config.log_dir)?;
        let hierarchy = Hierarchy::detect(&config.cgroup_root);
        let networks = NetworkManager::new(&config)?;
        Ok(Self::with_parts(config, launcher, hierarchy, networks))
    }

    /// Assembles an engine from explicit parts.
    #[must_use]
    pub fn with_parts(
        config: CorralConfig,
        launcher: Launcher,
        hierarchy: Hierarchy,
        networks: NetworkManager,
    ) -> Self {
        let state = StateStore::new(&config.container_dir);
        Self {
            config,
            launcher,
            hierarchy,
            networks,
            state,
        }
    }

    /// Returns the network manager.
    #[must_use]
    pub const fn networks(&self) -> &NetworkManager {
        &self.networks
    }

    /// Returns the network manager for create and delete.
    pub const fn networks_mut(&mut self) -> &mut NetworkManager {
        &mut self.networks
    }

    fn cgroup(&self, id: &ContainerId) -> CgroupManager {
        CgroupManager::new(
            self.hierarchy.clone(),
            std::path::Path::new(&self.config.cgroup_parent).join(id.as_str()),
        )
    }

    /// Runs a container.
    ///
    /// Detached runs return as soon as the workload is released; interactive
    /// runs wait for it, tear everything down and forget the container.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] for an empty command or ports without
    /// a network, [`CorralError::NotFound`] for an unknown network or image,
    /// or the error of the first failing step. Partial state is cleaned up.
    pub fn run(&self, options: &RunOptions) -> Result<RunOutcome> {
        if options.command.is_empty() {
            return Err(CorralError::Config {
                message: "no command given".into(),
            });
        }
        if !options.ports.is_empty() && options.network.is_none() {
            return Err(CorralError::Config {
                message: "port mappings require a network".into(),
            });
        }
        if let Some(name) = &options.network {
            let _ = self.networks.network(name)?;
        }

        let id = ContainerId::generate();
        let mut handle = self.launcher.launch(
            options.interactive,
            &options.image,
            &id,
            options.volume.as_ref(),
        )?;
        let mut cgroup = self.cgroup(&id);

        let endpoint = match self.configure(&mut handle, &mut cgroup, options) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.abort(handle, &cgroup, options.volume.as_ref(), None);
                return Err(e);
            }
        };

        let record = ContainerRecord {
            id: id.clone(),
            pid: handle.pid,
            image: options.image.clone(),
            command: options.command.join(" "),
            status: ContainerState::Running,
            limits: options.limits.clone(),
            network: options.network.clone(),
            endpoint: endpoint.clone(),
            volume: options.volume.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.state.save(&record) {
            self.abort(handle, &cgroup, options.volume.as_ref(), endpoint.as_ref());
            return Err(e);
        }

        handle.close_control();
        let pid = handle.pid;
        tracing::info!(id = %id, pid, image = %options.image, "container running");

        let exit_code = if options.interactive {
            Some(self.finish_interactive(&record, wait_for_exit(pid))?)
        } else {
            None
        };

        Ok(RunOutcome {
            id,
            pid,
            exit_code,
            endpoint,
        })
    }

    /// Releases everything an interactive container held once waiting for
    /// it is over. A failed wait still tears down and is then returned.
    fn finish_interactive(&self, record: &ContainerRecord, waited: Result<i32>) -> Result<i32> {
        if waited.is_err() {
            if let Err(e) = kill(record.pid) {
                tracing::warn!(id = %record.id, error = %e, "failed to kill container init");
            }
        }
        self.teardown(record);
        if let Err(e) = self.state.remove(record.id.as_str()) {
            tracing::warn!(id = %record.id, error = %e, "failed to remove container record");
        }
        let code = waited?;
        tracing::info!(id = %record.id, code, "container exited");
        Ok(code)
    }

    /// Limits, membership, command and network, in that order.
    fn configure(
        &self,
        handle: &mut ContainerHandle,
        cgroup: &mut CgroupManager,
        options: &RunOptions,
    ) -> Result<Option<Endpoint>> {
        cgroup.apply_limits(&options.limits)?;
        cgroup.add_process(handle.pid)?;
        handle.send_command(&options.command)?;
        options
            .network
            .as_deref()
            .map(|name| {
                self.networks
                    .connect(name, handle.id.as_str(), handle.pid, &options.ports)
            })
            .transpose()
    }

    /// Kills a half-started container while it still waits on the control
    /// pipe, then releases whatever it already holds.
    fn abort(
        &self,
        mut handle: ContainerHandle,
        cgroup: &CgroupManager,
        volume: Option<&Volume>,
        endpoint: Option<&Endpoint>,
    ) {
        tracing::warn!(id = %handle.id, pid = handle.pid, "aborting container start");
        if let Err(e) = kill(handle.pid) {
            tracing::warn!(id = %handle.id, error = %e, "failed to kill container init");
        }
        handle.close_control();
        self.release_endpoint(endpoint);
        if let Err(e) = cgroup.remove() {
            tracing::warn!(id = %handle.id, error = %e, "failed to remove cgroup");
        }
        if let Err(e) = self.launcher.workspace().teardown(handle.id.as_str(), volume) {
            tracing::warn!(id = %handle.id, error = %e, "failed to tear down workspace");
        }
    }

    fn release_endpoint(&self, endpoint: Option<&Endpoint>) {
        if let Some(endpoint) = endpoint {
            if let Err(e) = self.networks.disconnect(endpoint) {
                tracing::warn!(endpoint = %endpoint.id, error = %e, "failed to disconnect endpoint");
            }
        }
    }

    /// Releases the network endpoint, cgroup and workspace of a container
    /// whose process is gone. Each step is attempted; failures are logged.
    fn teardown(&self, record: &ContainerRecord) {
        self.release_endpoint(record.endpoint.as_ref());
        if let Err(e) = self.cgroup(&record.id).remove() {
            tracing::warn!(id = %record.id, error = %e, "failed to remove cgroup");
        }
        if let Err(e) = self
            .launcher
            .workspace()
            .teardown(record.id.as_str(), record.volume.as_ref())
        {
            tracing::warn!(id = %record.id, error = %e, "failed to tear down workspace");
        }
    }

    /// Stops a container and releases its resources.
    ///
    /// Stopping a stopped container is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for an unknown id, or an error if
    /// the process cannot be signalled or the record cannot be written.
    pub fn stop(&self, id: &str) -> Result<()> {
        let mut record = self.state.load(id)?;
        if record.status == ContainerState::Stopped {
            tracing::info!(id, "container already stopped");
            return Ok(());
        }

        terminate(record.pid, STOP_GRACE)?;
        self.teardown(&record);
        record.status = ContainerState::Stopped;
        self.state.save(&record)?;
        tracing::info!(id, "container stopped");
        Ok(())
    }

    /// Lists every known container, oldest first.
    ///
    /// A running record whose process has exited is reported as stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the record directory cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let mut records = self.state.list()?;
        for record in &mut records {
            if record.status == ContainerState::Running && !is_alive(record.pid) {
                record.status = ContainerState::Stopped;
            }
        }
        Ok(records)
    }

    /// Returns the captured output of a detached container.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for an unknown id, or an error if
    /// the log file cannot be read.
    pub fn logs(&self, id: &str) -> Result<String> {
        let record = self.state.load(id)?;
        read_logs(&self.config.log_dir, record.id.as_str())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::net::Ipv4Addr;
    use std::path::{Path, PathBuf};

    use corral_core::namespace::NamespaceConfig;
    use corral_network::Network;
    use corral_network::driver::NetworkDriver;
    use corral_network::ipam::Ipam;
    use corral_network::model::parse_subnet;
    use corral_network::registry::NetworkRegistry;
    use ipnetwork::Ipv4Network;

    use super::*;
    use crate::workspace::WorkspaceProvider;

    /// Plain directories under `<data>/mnt` instead of overlay mounts.
    struct DirWorkspace(PathBuf);

    impl WorkspaceProvider for DirWorkspace {
        fn prepare(&self, _image: &str, id: &str, _volume: Option<&Volume>) -> Result<PathBuf> {
            let root = self.0.join(id);
            std::fs::create_dir_all(&root).unwrap();
            Ok(root)
        }

        fn teardown(&self, id: &str, _volume: Option<&Volume>) -> Result<()> {
            let root = self.0.join(id);
            if root.exists() {
                std::fs::remove_dir_all(root).unwrap();
            }
            Ok(())
        }
    }

    /// Driver that changes nothing on the host; `fail_connect` makes every
    /// attachment fail.
    #[derive(Default)]
    struct NoopDriver {
        fail_connect: bool,
    }

    impl NetworkDriver for NoopDriver {
        fn name(&self) -> &str {
            "bridge"
        }

        fn create_network(
            &self,
            name: &str,
            subnet: Ipv4Network,
            gateway: Ipv4Addr,
        ) -> Result<Network> {
            Ok(Network {
                name: name.into(),
                driver: "bridge".into(),
                subnet,
                gateway,
            })
        }

        fn delete_network(&self, _network: &Network) -> Result<()> {
            Ok(())
        }

        fn connect(&self, _network: &Network, _endpoint: &Endpoint) -> Result<()> {
            if self.fail_connect {
                return Err(CorralError::network("veth setup failed"));
            }
            Ok(())
        }

        fn disconnect(&self, _network: &Network, _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }
    }

    fn no_namespaces() -> NamespaceConfig {
        NamespaceConfig {
            pid: false,
            mount: false,
            network: false,
            user: false,
            ipc: false,
            uts: false,
        }
    }

    fn engine(dir: &Path, script: &str, hierarchy: Hierarchy) -> Engine {
        engine_with(dir, script, hierarchy, NoopDriver::default())
    }

    fn engine_with(dir: &Path, script: &str, hierarchy: Hierarchy, driver: NoopDriver) -> Engine {
        let config = CorralConfig::from_data_dir(dir);
        let launcher = Launcher::with_init(
            Box::new(DirWorkspace(config.mnt_dir.clone())),
            &config.log_dir,
            "/bin/sh",
            vec!["-c".into(), script.into()],
        )
        .namespaces(no_namespaces());
        let registry = NetworkRegistry::load(&config.network_dir).unwrap();
        let mut networks = NetworkManager::with_parts(registry, Ipam::new(&config.ipam_file));
        networks.register_driver(Box::new(driver));
        Engine::with_parts(config, launcher, hierarchy, networks)
    }

    fn options(command: &[&str]) -> RunOptions {
        RunOptions {
            image: "busybox".into(),
            command: command.iter().map(ToString::to_string).collect(),
            ..RunOptions::default()
        }
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map_or(0, Iterator::count)
    }

    #[test]
    fn detached_run_applies_limits_before_release() {
        let dir = tempfile::tempdir().unwrap();
        let cgroups = dir.path().join("cgroup");
        let engine = engine(dir.path(), "cat <&3 > received", Hierarchy::legacy(&cgroups));

        let mut opts = options(&["/bin/echo", "hi"]);
        opts.limits.memory_limit = Some("100m".into());
        let outcome = engine.run(&opts).unwrap();
        assert!(outcome.exit_code.is_none());

        let group = cgroups.join("memory").join("corral").join(outcome.id.as_str());
        assert_eq!(
            std::fs::read_to_string(group.join("memory.limit_in_bytes")).unwrap(),
            "100m"
        );
        assert_eq!(
            std::fs::read_to_string(group.join("tasks")).unwrap(),
            outcome.pid.to_string()
        );
        assert!(!cgroups.join("cpu").exists());

        assert_eq!(wait_for_exit(outcome.pid).unwrap(), 0);
        let root = dir.path().join("mnt").join(outcome.id.as_str());
        assert_eq!(
            std::fs::read_to_string(root.join("received")).unwrap(),
            "/bin/echo hi"
        );

        let listed = engine.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, outcome.id);
        assert_eq!(listed[0].status, ContainerState::Stopped);
    }

    #[test]
    fn interactive_run_waits_and_forgets_container() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            dir.path(),
            "cat <&3 >/dev/null; exit 3",
            Hierarchy::legacy(dir.path().join("cgroup")),
        );

        let mut opts = options(&["/bin/false"]);
        opts.interactive = true;
        let outcome = engine.run(&opts).unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!is_alive(outcome.pid));
        assert!(engine.list().unwrap().is_empty());
        assert_eq!(entries(&dir.path().join("mnt")), 0);
    }

    #[test]
    fn networked_run_holds_an_address_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(
            dir.path(),
            "cat <&3 >/dev/null; exec sleep 30",
            Hierarchy::legacy(dir.path().join("cgroup")),
        );
        let subnet = parse_subnet("192.168.10.0/24").unwrap();
        let _ = engine
            .networks_mut()
            .create_network("net1", "bridge", subnet)
            .unwrap();

        let mut opts = options(&["/bin/server"]);
        opts.network = Some("net1".into());
        opts.ports = vec![PortMapping {
            host: 8080,
            container: 80,
        }];
        let outcome = engine.run(&opts).unwrap();
        let endpoint = outcome.endpoint.unwrap();
        assert_eq!(endpoint.ip_address, Ipv4Addr::new(192, 168, 10, 2));
        assert_eq!(endpoint.id, format!("{}-net1", outcome.id));

        engine.stop(outcome.id.as_str()).unwrap();
        assert!(!is_alive(outcome.pid));
        assert!(
            !engine
                .networks()
                .ipam()
                .is_allocated(&subnet, endpoint.ip_address)
                .unwrap()
        );
        let listed = engine.list().unwrap();
        assert_eq!(listed[0].status, ContainerState::Stopped);
        assert_eq!(listed[0].endpoint.as_ref(), Some(&endpoint));

        // A second stop finds nothing left to do.
        engine.stop(outcome.id.as_str()).unwrap();
    }

    #[test]
    fn unknown_network_fails_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "exit 0", Hierarchy::legacy(dir.path().join("cgroup")));

        let mut opts = options(&["/bin/true"]);
        opts.network = Some("ghost".into());
        assert!(matches!(
            engine.run(&opts),
            Err(CorralError::NotFound { kind: "network", .. })
        ));
        assert_eq!(entries(&dir.path().join("mnt")), 0);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "exit 0", Hierarchy::legacy(dir.path().join("cgroup")));

        assert!(engine.run(&options(&[])).is_err());
        let mut opts = options(&["/bin/true"]);
        opts.ports = vec![PortMapping {
            host: 80,
            container: 80,
        }];
        assert!(matches!(engine.run(&opts), Err(CorralError::Config { .. })));
    }

    #[test]
    fn failed_limit_aborts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            dir.path(),
            "cat <&3 >/dev/null; exec sleep 30",
            Hierarchy::unified(dir.path().join("cgroup")),
        );

        let mut opts = options(&["/bin/true"]);
        opts.limits.cpu_share = Some("lots".into());
        assert!(engine.run(&opts).is_err());
        assert_eq!(entries(&dir.path().join("mnt")), 0);
        assert!(engine.list().unwrap().is_empty());
    }

    /// Init script that ignores SIGTERM and leaves `marker` behind once the
    /// control pipe is closed.
    fn stubborn_init(marker: &Path) -> String {
        format!(
            "trap '' TERM; cat <&3 >/dev/null; touch {}; exec sleep 30",
            marker.display()
        )
    }

    fn networked(engine: &mut Engine) -> Ipv4Network {
        let subnet = parse_subnet("192.168.10.0/24").unwrap();
        let _ = engine
            .networks_mut()
            .create_network("net1", "bridge", subnet)
            .unwrap();
        subnet
    }

    #[test]
    fn failed_connect_kills_init_before_the_workload_starts() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("workload_ran");
        let cgroups = dir.path().join("cgroup");
        let mut engine = engine_with(
            dir.path(),
            &stubborn_init(&marker),
            Hierarchy::legacy(&cgroups),
            NoopDriver { fail_connect: true },
        );
        let subnet = networked(&mut engine);

        let mut opts = options(&["/bin/server"]);
        opts.network = Some("net1".into());
        opts.limits.memory_limit = Some("100m".into());
        assert!(matches!(engine.run(&opts), Err(CorralError::NetworkConfig { .. })));

        std::thread::sleep(Duration::from_millis(200));
        assert!(!marker.exists());
        assert!(
            !engine
                .networks()
                .ipam()
                .is_allocated(&subnet, Ipv4Addr::new(192, 168, 10, 2))
                .unwrap()
        );
        assert_eq!(entries(&dir.path().join("mnt")), 0);
        assert!(engine.list().unwrap().is_empty());
    }

    #[test]
    fn failed_record_write_releases_endpoint_and_kills_init() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("workload_ran");
        let mut engine = engine(
            dir.path(),
            &stubborn_init(&marker),
            Hierarchy::legacy(dir.path().join("cgroup")),
        );
        let subnet = networked(&mut engine);
        // A plain file where the record directory belongs makes the save fail.
        std::fs::write(dir.path().join("containers"), b"").unwrap();

        let mut opts = options(&["/bin/server"]);
        opts.network = Some("net1".into());
        assert!(engine.run(&opts).is_err());

        std::thread::sleep(Duration::from_millis(200));
        assert!(!marker.exists());
        assert!(
            !engine
                .networks()
                .ipam()
                .is_allocated(&subnet, Ipv4Addr::new(192, 168, 10, 2))
                .unwrap()
        );
        assert_eq!(entries(&dir.path().join("mnt")), 0);
    }

    #[test]
    fn failed_interactive_wait_still_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(
            dir.path(),
            "cat <&3 >/dev/null; exec sleep 30",
            Hierarchy::legacy(dir.path().join("cgroup")),
        );
        let subnet = networked(&mut engine);

        let mut opts = options(&["/bin/server"]);
        opts.network = Some("net1".into());
        let outcome = engine.run(&opts).unwrap();
        let record = engine.state.load(outcome.id.as_str()).unwrap();

        let waited = Err(CorralError::Namespace {
            message: "waitpid failed".into(),
        });
        assert!(engine.finish_interactive(&record, waited).is_err());
        assert!(!is_alive(outcome.pid));
        assert!(
            !engine
                .networks()
                .ipam()
                .is_allocated(&subnet, Ipv4Addr::new(192, 168, 10, 2))
                .unwrap()
        );
        assert!(engine.list().unwrap().is_empty());
        assert_eq!(entries(&dir.path().join("mnt")), 0);
    }

    #[test]
    fn detached_output_is_readable_as_logs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            dir.path(),
            "cat <&3 >/dev/null; echo started",
            Hierarchy::legacy(dir.path().join("cgroup")),
        );

        let outcome = engine.run(&options(&["/bin/app"])).unwrap();
        assert_eq!(wait_for_exit(outcome.pid).unwrap(), 0);
        assert_eq!(engine.logs(outcome.id.as_str()).unwrap(), "started\n");
        assert!(matches!(
            engine.logs("missing"),
            Err(CorralError::NotFound { kind: "container", .. })
        ));
    }
}
