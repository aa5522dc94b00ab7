//! In-process container driving a [`Framework`] directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn, Instrument};

use super::{
    aborted_start_wait, find_probe_invoker, framework_properties, provision_framework, shutdown_framework,
    uninstall_all, ContainerState, TestContainer, TestContainerFactory,
};
use crate::address::{TestAddress, TestDescription};
use crate::constants::START_LEVEL_TEST_BUNDLE;
use crate::error::{ExamError, ExamResult};
use crate::events::{TestEvent, TestListener};
use crate::framework::extender::METHOD_CALL;
use crate::framework::{BundleId, Framework, FrameworkFactory};
use crate::obs;
use crate::probe::Probe;
use crate::system::ExamSystem;

pub struct NativeTestContainer {
    name: String,
    parent: Arc<ExamSystem>,
    factory: Arc<dyn FrameworkFactory>,
    system: Option<ExamSystem>,
    framework: Option<Arc<dyn Framework>>,
    installed: Vec<BundleId>,
    probes: Vec<BundleId>,
    state: ContainerState,
}

impl NativeTestContainer {
    pub fn new(system: Arc<ExamSystem>, factory: Arc<dyn FrameworkFactory>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            name: format!("native-{}", &id[..8]),
            parent: system,
            factory,
            system: None,
            framework: None,
            installed: Vec::new(),
            probes: Vec::new(),
            state: ContainerState::Unstarted,
        }
    }

    fn timeout(&self) -> Duration {
        self.system
            .as_ref()
            .map(ExamSystem::timeout)
            .unwrap_or_else(|| self.parent.timeout())
    }

    fn framework(&self) -> ExamResult<Arc<dyn Framework>> {
        match (&self.state, &self.framework) {
            (ContainerState::Started, Some(framework)) => Ok(Arc::clone(framework)),
            _ => Err(ExamError::container(format!("container {} is not started", self.name))),
        }
    }

    /// Uninstall everything tracked, newest first, ignoring failures.
    async fn cleanup(&mut self) {
        match self.framework.clone() {
            Some(framework) => uninstall_all(&self.name, framework.as_ref(), &mut self.installed).await,
            None => self.installed.clear(),
        }
        self.probes.clear();
    }

    async fn start_inner(&mut self) -> ExamResult<()> {
        let began = Instant::now();
        let system = self.parent.fork(Vec::new())?;
        let properties = framework_properties(&system)?;
        let framework = self.factory.new_framework(properties)?;
        self.framework = Some(Arc::clone(&framework));

        let provisions = system
            .provision_options()
            .into_iter()
            .map(|option| (option, option.url.clone()))
            .collect();
        let result =
            provision_framework(&self.name, framework.as_ref(), &system, provisions, &mut self.installed).await;
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
                self.abort_start().await;
                Err(e)
            }
        }
    }

    async fn stop_inner(&mut self) -> ExamResult<()> {
        let began = Instant::now();
        let timeout = self.timeout();
        self.cleanup().await;
        let result = match self.framework.take() {
            Some(framework) => shutdown_framework(framework, timeout).await,
            None => Ok(()),
        };
        if let Some(mut system) = self.system.take() {
            system.clear();
        }
        self.state = ContainerState::Stopped;
        match &result {
            Ok(()) => obs::emit_container_stopped(&self.name, began.elapsed().as_millis() as u64),
            Err(e) => warn!(container = %self.name, error = %e, "framework did not stop cleanly"),
        }
        result
    }

    async fn abort_start(&mut self) {
        self.cleanup().await;
        if let Some(framework) = self.framework.take() {
            if let Err(e) = shutdown_framework(framework, aborted_start_wait(self.timeout())).await {
                obs::emit_cleanup_failure(&self.name, "stop", &e);
            }
        }
        if let Some(mut system) = self.system.take() {
            system.clear();
        }
    }
}

#[async_trait]
impl TestContainer for NativeTestContainer {
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
            warn!(container = %self.name, "framework does not exist, called start() before?");
            return Ok(());
        }
        let span = obs::container_span(&self.name);
        self.stop_inner().instrument(span).await
    }

    async fn install(&mut self, location: &str, content: Vec<u8>) -> ExamResult<BundleId> {
        let framework = self.framework()?;
        let id = framework.install_bundle(location, Some(content)).await?;
        self.installed.push(id);
        framework.set_bundle_start_level(id, START_LEVEL_TEST_BUNDLE).await?;
        framework.start_bundle(id).await?;
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
        let framework = self.framework()?;
        for id in std::mem::take(&mut self.probes) {
            self.installed.retain(|i| *i != id);
            framework.uninstall_bundle(id).await?;
        }
        Ok(())
    }

    async fn call(&mut self, address: &TestAddress) -> ExamResult<()> {
        let framework = self.framework()?;
        let began = Instant::now();
        let reference = find_probe_invoker(framework.as_ref(), address, self.timeout()).await?;
        let result = framework
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

    async fn run_test(&mut self, address: &TestAddress, listener: Arc<dyn TestListener>) -> ExamResult<()> {
        let description = TestDescription::from(address);
        TestEvent::started(description.clone()).dispatch(listener.as_ref());
        match self.call(address).await {
            Ok(()) => {
                TestEvent::succeeded(description).dispatch(listener.as_ref());
                Ok(())
            }
            Err(ExamError::Invocation(failure)) => {
                info!(test = %description, failure = %failure, "test failed");
                TestEvent::failed(description, failure).dispatch(listener.as_ref());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Creates [`NativeTestContainer`]s over one runtime factory.
#[derive(Clone)]
pub struct NativeTestContainerFactory {
    factory: Arc<dyn FrameworkFactory>,
}

impl NativeTestContainerFactory {
    pub fn new(factory: Arc<dyn FrameworkFactory>) -> Self {
        Self { factory }
    }
}

impl TestContainerFactory for NativeTestContainerFactory {
    fn create(&self, system: Arc<ExamSystem>) -> ExamResult<Box<dyn TestContainer>> {
        Ok(Box::new(NativeTestContainer::new(system, Arc::clone(&self.factory))))
    }
}
