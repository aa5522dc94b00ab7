//! Container running its runtime inside a spawned `probekit-host` process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use probekit_core::constants::{INVOKER_PORT_PROPERTY, START_LEVEL_TEST_BUNDLE};
use probekit_core::container::{
    aborted_start_wait, find_probe_invoker, framework_properties, provision_framework, shutdown_framework,
    uninstall_all,
};
use probekit_core::framework::extender::{METHOD_CALL, METHOD_RUN_TEST};
use probekit_core::framework::{BundleId, Framework};
use probekit_core::{
    obs, ContainerState, ExamError, ExamOption, ExamResult, ExamSettings, ExamSystem, OptionKind,
    Probe, TestAddress, TestContainer, TestContainerFactory, TestDescription, TestListener,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn, Instrument};

use crate::client::RemoteFramework;
use crate::env::{parent_environment, prepare_environment};
use crate::listener::TestListenerTask;
use crate::protocol::LISTENING_PREFIX;

/// Explicit invoker port, else the first port of the configured range that
/// can currently be bound on the local host.
pub fn choose_invoker_port(settings: &ExamSettings) -> ExamResult<u16> {
    if let Some(port) = settings.invoker_port {
        return Ok(port);
    }
    let (lower, upper) = settings.invoker_port_range;
    (lower..=upper)
        .find(|port| std::net::TcpListener::bind(("127.0.0.1", *port)).is_ok())
        .ok_or_else(|| ExamError::container(format!("no free invoker port in range {lower}..={upper}")))
}

/// Read stdout until the host announces its RPC port.
async fn await_announcement(lines: &mut Lines<BufReader<ChildStdout>>) -> ExamResult<u16> {
    while let Some(line) = lines.next_line().await? {
        match line.strip_prefix(LISTENING_PREFIX) {
            Some(port) => {
                return port.trim().parse().map_err(|_| {
                    ExamError::container(format!("runtime host announced a bad port: {line}"))
                })
            }
            None => debug!(line = %line, "runtime host output"),
        }
    }
    Err(ExamError::container("runtime host exited before announcing its port"))
}

pub struct ForkedTestContainer {
    name: String,
    parent: Arc<ExamSystem>,
    host: PathBuf,
    system: Option<ExamSystem>,
    child: Option<Child>,
    remote: Option<Arc<RemoteFramework>>,
    invoker_port: Option<u16>,
    installed: Vec<BundleId>,
    probes: Vec<BundleId>,
    state: ContainerState,
}

impl ForkedTestContainer {
    pub fn new(system: Arc<ExamSystem>, host: impl Into<PathBuf>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            name: format!("forked-{}", &id[..8]),
            parent: system,
            host: host.into(),
            system: None,
            child: None,
            remote: None,
            invoker_port: None,
            installed: Vec::new(),
            probes: Vec::new(),
            state: ContainerState::Unstarted,
        }
    }

    /// Process id of the running host, if any.
    pub fn host_pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn timeout(&self) -> Duration {
        self.system
            .as_ref()
            .map(ExamSystem::timeout)
            .unwrap_or_else(|| self.parent.timeout())
    }

    fn remote(&self) -> ExamResult<Arc<RemoteFramework>> {
        match (&self.state, &self.remote) {
            (ContainerState::Started, Some(remote)) => Ok(Arc::clone(remote)),
            _ => Err(ExamError::container(format!("container {} is not started", self.name))),
        }
    }

    fn host_command(&self, system: &ExamSystem, invoker_port: u16) -> ExamResult<Command> {
        let mut command = Command::new(&self.host);
        command
            .arg("--port")
            .arg("0")
            .arg("--invoker-port")
            .arg(invoker_port.to_string());

        let mut properties = framework_properties(system)?;
        properties.insert(INVOKER_PORT_PROPERTY.to_string(), invoker_port.to_string());
        for (key, value) in properties {
            command.arg("--framework-property").arg(format!("{key}={value}"));
        }
        for (key, value) in host_system_properties(system) {
            command.arg("--system-property").arg(format!("{key}={value}"));
        }
        for option in system.options(OptionKind::HostArgument) {
            if let ExamOption::HostArgument { argument } = option {
                command.arg(argument);
            }
        }

        let entries: Vec<String> = system
            .options(OptionKind::Environment)
            .into_iter()
            .filter_map(|o| match o {
                ExamOption::Environment { entry } => Some(entry.clone()),
                _ => None,
            })
            .collect();
        let environment = prepare_environment(&entries, &parent_environment())?;
        debug!(variables = ?environment.keys().collect::<Vec<_>>(), "host environment");
        command.env_clear().envs(environment);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(command)
    }

    /// Copy a `file:` provision into the working area so the host never
    /// reads the caller's files directly. `reference:` locations and other
    /// schemes pass through untouched.
    async fn stage_location(&self, system: &ExamSystem, index: usize, url: &str) -> ExamResult<String> {
        if url.starts_with("reference:") {
            return Ok(url.to_string());
        }
        let Some(source) = url.strip_prefix("file:") else {
            return Ok(url.to_string());
        };
        let downloads = system.temp_folder()?.join("downloads");
        tokio::fs::create_dir_all(&downloads).await?;
        let file_name = Path::new(source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let target = downloads.join(format!("{index:03}-{file_name}"));
        tokio::fs::copy(source, &target).await.map_err(|e| {
            ExamError::container_caused_by(format!("cannot copy provision {url}"), e)
        })?;
        Ok(format!("file:{}", target.display()))
    }

    async fn launch(&mut self, system: &ExamSystem) -> ExamResult<Arc<RemoteFramework>> {
        let invoker_port = choose_invoker_port(system.settings())?;
        let mut command = self.host_command(system, invoker_port)?;
        let mut child = command.spawn().map_err(|e| {
            ExamError::container_caused_by(format!("cannot spawn runtime host {}", self.host.display()), e)
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExamError::container("runtime host stdout is not captured"))?;
        self.child = Some(child);
        self.invoker_port = Some(invoker_port);

        let timeout = system.timeout();
        let mut lines = BufReader::new(stdout).lines();
        let port = tokio::time::timeout(timeout, await_announcement(&mut lines))
            .await
            .map_err(|_| ExamError::timeout("runtime host announcement", timeout))??;
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "runtime host output");
            }
        });

        let remote = Arc::new(RemoteFramework::connect(&format!("127.0.0.1:{port}")).await.map_err(|e| {
            ExamError::container_caused_by("cannot reach runtime host", e)
        })?);
        self.remote = Some(Arc::clone(&remote));
        info!(container = %self.name, pid = ?self.host_pid(), port, invoker_port, "runtime host up");
        Ok(remote)
    }

    async fn provision(&mut self, system: &ExamSystem) -> ExamResult<u32> {
        let remote = self.launch(system).await?;
        let mut provisions = Vec::new();
        for (index, option) in system.provision_options().into_iter().enumerate() {
            let location = self.stage_location(system, index, &option.url).await?;
            provisions.push((option, location));
        }
        provision_framework(&self.name, remote.as_ref(), system, provisions, &mut self.installed).await
    }

    async fn cleanup(&mut self) {
        match self.remote.clone() {
            Some(remote) => uninstall_all(&self.name, remote.as_ref(), &mut self.installed).await,
            None => self.installed.clear(),
        }
        self.probes.clear();
    }

    /// Wait for the host to exit once its connection is gone; kill it if it
    /// does not.
    async fn reap(&mut self, timeout: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(container = %self.name, %status, "runtime host exited"),
            Ok(Err(e)) => obs::emit_cleanup_failure(&self.name, "wait", &e),
            Err(_) => {
                warn!(container = %self.name, "runtime host did not exit, killing it");
                if let Err(e) = child.kill().await {
                    obs::emit_cleanup_failure(&self.name, "kill", &e);
                }
            }
        }
    }

    /// Tear down everything: installs, runtime, host process, working area.
    /// Each bounded wait uses `timeout`.
    async fn teardown(&mut self, timeout: Duration) -> ExamResult<()> {
        self.cleanup().await;
        let result = match self.remote.take() {
            Some(remote) => shutdown_framework(remote, timeout).await,
            None => Ok(()),
        };
        self.reap(timeout).await;
        self.invoker_port = None;
        if let Some(mut system) = self.system.take() {
            system.clear();
        }
        result
    }

    async fn start_inner(&mut self) -> ExamResult<()> {
        let began = Instant::now();
        let system = self.parent.fork(Vec::new())?;
        let result = self.provision(&system).await;
        self.system = Some(system);
        match result {
            Ok(level) => {
                self.state = ContainerState::Started;
                obs::emit_container_started(
                    &self.name,
                    level,
                    self.installed.len(),
                    began.elapsed().as_millis() as u64,
                );
                Ok(())
            }
            Err(e) => {
                warn!(container = %self.name, error = %e, "start failed, tearing down");
                if let Err(cleanup) = self.teardown(aborted_start_wait(self.timeout())).await {
                    obs::emit_cleanup_failure(&self.name, "stop", &cleanup);
                }
                Err(e)
            }
        }
    }

    async fn stop_inner(&mut self) -> ExamResult<()> {
        let began = Instant::now();
        let result = self.teardown(self.timeout()).await;
        self.state = ContainerState::Stopped;
        match &result {
            Ok(()) => obs::emit_container_stopped(&self.name, began.elapsed().as_millis() as u64),
            Err(e) => warn!(container = %self.name, error = %e, "runtime host did not stop cleanly"),
        }
        result
    }
}

/// Host-level properties: declared system properties plus propagated ones
/// that are set in this process.
fn host_system_properties(system: &ExamSystem) -> Vec<(String, String)> {
    let mut properties = system.system_properties();
    for option in system.options(OptionKind::PropagateSystemProperty) {
        if let ExamOption::PropagateSystemProperty { key } = option {
            match std::env::var(key) {
                Ok(value) => properties.push((key.clone(), value)),
                Err(_) => debug!(key = %key, "propagated property is not set, skipping"),
            }
        }
    }
    properties
}

#[async_trait]
impl TestContainer for ForkedTestContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ContainerState {
        self.state
    }

    async fn start(&mut self) -> ExamResult<()> {
        if self.state == ContainerState::Started {
            return Err(ExamError::container(format!(
                "container {} is already started",
                self.name
            )));
        }
        let span = obs::container_span(&self.name);
        self.start_inner().instrument(span).await
    }

    async fn stop(&mut self) -> ExamResult<()> {
        if self.state != ContainerState::Started {
            warn!(container = %self.name, "runtime host does not exist, called start() before?");
            return Ok(());
        }
        let span = obs::container_span(&self.name);
        self.stop_inner().instrument(span).await
    }

    async fn install(&mut self, location: &str, content: Vec<u8>) -> ExamResult<BundleId> {
        let remote = self.remote()?;
        let id = remote.install_bundle(location, Some(content)).await?;
        self.installed.push(id);
        remote.set_bundle_start_level(id, START_LEVEL_TEST_BUNDLE).await?;
        remote.start_bundle(id).await?;
        debug!(bundle = id, location, "installed");
        Ok(id)
    }

    async fn install_probe(&mut self, probe: &Probe) -> ExamResult<BundleId> {
        let id = self.install(&probe.location(), probe.bytes().to_vec()).await?;
        self.probes.push(id);
        obs::emit_probe_installed(&self.name, id, probe.addresses().len());
        Ok(id)
    }

    async fn uninstall_probe(&mut self) -> ExamResult<()> {
        let remote = self.remote()?;
        for id in std::mem::take(&mut self.probes) {
            self.installed.retain(|i| *i != id);
            remote.uninstall_bundle(id).await?;
        }
        Ok(())
    }

    async fn call(&mut self, address: &TestAddress) -> ExamResult<()> {
        let remote = self.remote()?;
        let began = Instant::now();
        let reference = find_probe_invoker(remote.as_ref(), address, self.timeout()).await?;
        let result = remote
            .invoke_service(&reference, METHOD_CALL, address.arguments().to_vec())
            .await
            .map(|_: Value| ())
            .map_err(ExamError::from);
        obs::emit_test_invoked(
            &self.name,
            address.root().identifier(),
            result.is_ok(),
            began.elapsed().as_millis() as u64,
        );
        result
    }

    /// Run through the host's `run_test`, receiving the outcome on the
    /// invoker port while the call is in flight.
    async fn run_test(&mut self, address: &TestAddress, listener: Arc<dyn TestListener>) -> ExamResult<()> {
        let remote = self.remote()?;
        let port = self
            .invoker_port
            .ok_or_else(|| ExamError::container("no invoker port assigned"))?;
        let reference = find_probe_invoker(remote.as_ref(), address, self.timeout()).await?;
        let description = TestDescription::from(address);
        let args = vec![
            serde_json::to_value(&description)?,
            Value::Array(address.arguments().to_vec()),
        ];

        let task = TestListenerTask::spawn(port, listener).await?;
        match remote.invoke_service(&reference, METHOD_RUN_TEST, args).await {
            Ok(_) => {
                let outcome = task.join(self.timeout()).await?;
                debug!(test = %description, outcome = ?outcome, "remote test finished");
                Ok(())
            }
            Err(e) => {
                task.abort();
                Err(e.into())
            }
        }
    }
}

/// Creates [`ForkedTestContainer`]s spawning the given host executable.
#[derive(Debug, Clone)]
pub struct ForkedTestContainerFactory {
    host: PathBuf,
}

impl ForkedTestContainerFactory {
    pub fn new(host: impl Into<PathBuf>) -> Self {
        Self { host: host.into() }
    }
}

impl TestContainerFactory for ForkedTestContainerFactory {
    fn create(&self, system: Arc<ExamSystem>) -> ExamResult<Box<dyn TestContainer>> {
        Ok(Box::new(ForkedTestContainer::new(system, self.host.clone())))
    }
}
