//! Test containers: one stateful handle per runtime instance.

pub mod native;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::address::TestAddress;
use crate::constants::{
    ABORTED_START_STOP_TIMEOUT, FRAMEWORK_BOOTDELEGATION, FRAMEWORK_STORAGE, FRAMEWORK_STORAGE_CLEAN,
    FRAMEWORK_STORAGE_CLEAN_ONFIRSTINIT, FRAMEWORK_SYSTEMPACKAGES_EXTRA, REPOSITORIES_PROPERTY,
    START_LEVEL_DEFAULT_PROVISION, START_LEVEL_TEST_BUNDLE, STOP_WATCHDOG_GRACE,
};
use crate::error::{ExamError, ExamResult};
use crate::events::TestListener;
use crate::filter::ServiceFilter;
use crate::framework::{
    BundleId, BundleInfo, BundleState, Framework, FrameworkEvent, FrameworkState, ServiceReference,
};
use crate::obs;
use crate::options::{OptionKind, ProvisionOption};
use crate::probe::Probe;
use crate::system::ExamSystem;

pub use native::{NativeTestContainer, NativeTestContainerFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Unstarted,
    Started,
    Stopped,
}

/// Lifecycle contract shared by every container variant.
///
/// Methods take `&mut self`: calls on one container never overlap.
#[async_trait]
pub trait TestContainer: Send {
    fn name(&self) -> &str;

    fn state(&self) -> ContainerState;

    /// Provision the runtime and wait for its target start level.
    /// Fails if the container is already started.
    async fn start(&mut self) -> ExamResult<()>;

    /// Tear down everything `start` and the installs created. A no-op on a
    /// container that was never started.
    async fn stop(&mut self) -> ExamResult<()>;

    /// Install and start a unit at the test start level.
    async fn install(&mut self, location: &str, content: Vec<u8>) -> ExamResult<BundleId>;

    async fn install_probe(&mut self, probe: &Probe) -> ExamResult<BundleId>;

    /// Remove every installed probe.
    async fn uninstall_probe(&mut self) -> ExamResult<()>;

    /// Invoke the test at `address`; a failing test surfaces as
    /// [`ExamError::Invocation`].
    async fn call(&mut self, address: &TestAddress) -> ExamResult<()>;

    /// Run the test at `address`, delivering outcome events to `listener`.
    /// Test failures are reported to the listener, not returned.
    async fn run_test(&mut self, address: &TestAddress, listener: Arc<dyn TestListener>) -> ExamResult<()>;
}

pub trait TestContainerFactory: Send + Sync {
    fn create(&self, system: Arc<ExamSystem>) -> ExamResult<Box<dyn TestContainer>>;
}

/// Runtime properties computed from a system: storage, exported system
/// packages, boot delegation, repositories and declared framework
/// properties.
pub fn framework_properties(system: &ExamSystem) -> ExamResult<BTreeMap<String, String>> {
    let mut properties = BTreeMap::new();
    let storage = system.temp_folder()?.join("cache");
    properties.insert(FRAMEWORK_STORAGE.to_string(), storage.display().to_string());
    if system.clean_caches() {
        properties.insert(
            FRAMEWORK_STORAGE_CLEAN.to_string(),
            FRAMEWORK_STORAGE_CLEAN_ONFIRSTINIT.to_string(),
        );
    }
    for (kind, key) in [
        (OptionKind::SystemPackage, FRAMEWORK_SYSTEMPACKAGES_EXTRA),
        (OptionKind::BootDelegation, FRAMEWORK_BOOTDELEGATION),
        (OptionKind::Repository, REPOSITORIES_PROPERTY),
    ] {
        let joined = system.joined_values(kind)?;
        if !joined.is_empty() {
            properties.insert(key.to_string(), joined);
        }
    }
    properties.extend(system.framework_properties());
    Ok(properties)
}

/// Log every unit left `Installed` after start; fatal only when
/// `fail_on_unresolved` is set.
pub fn verify_resolved(container: &str, bundles: &[BundleInfo], fail_on_unresolved: bool) -> ExamResult<()> {
    let unresolved: Vec<&BundleInfo> = bundles
        .iter()
        .filter(|b| b.state == BundleState::Installed)
        .collect();
    for bundle in &unresolved {
        obs::emit_bundle_unresolved(container, bundle);
    }
    if fail_on_unresolved && !unresolved.is_empty() {
        let names: Vec<String> = unresolved.iter().map(|b| b.to_string()).collect();
        return Err(ExamError::container(format!(
            "There are unresolved bundles: {}",
            names.join(", ")
        )));
    }
    Ok(())
}

/// Bring `framework` up from the system's provisions: install each one at
/// its resolved location in declaration order, assign start levels, start
/// the runtime and wait for the target level.
///
/// Ids land in `installed` as they are created, so a failed start can
/// still uninstall what got in.
pub async fn provision_framework(
    container: &str,
    framework: &dyn Framework,
    system: &ExamSystem,
    provisions: Vec<(&ProvisionOption, String)>,
    installed: &mut Vec<BundleId>,
) -> ExamResult<u32> {
    framework.init().await?;
    for (option, location) in provisions {
        let id = framework.install_bundle(&location, None).await?;
        installed.push(id);
        let level = option.effective_start_level(START_LEVEL_DEFAULT_PROVISION);
        framework.set_bundle_start_level(id, level).await?;
        if option.update {
            framework.update_bundle(id, None).await?;
        }
        if option.start {
            framework.start_bundle(id).await?;
        }
        debug!(container, bundle = id, location = %location, level, start = option.start, "provisioned");
    }
    framework.start().await?;

    let target = system.framework_start_level().unwrap_or(START_LEVEL_TEST_BUNDLE);
    let timeout = system.timeout();
    if !framework.set_start_level_and_wait(target, timeout).await? {
        return Err(ExamError::timeout(format!("start level {target}"), timeout));
    }
    let bundles = framework.bundles().await?;
    verify_resolved(container, &bundles, system.fail_on_unresolved())?;
    Ok(target)
}

/// Uninstall everything in `installed`, newest first. A failure is logged
/// and the next one is still attempted.
pub async fn uninstall_all(container: &str, framework: &dyn Framework, installed: &mut Vec<BundleId>) {
    while let Some(id) = installed.pop() {
        match framework.uninstall_bundle(id).await {
            Ok(()) => debug!(container, bundle = id, "uninstalled"),
            Err(e) => obs::emit_cleanup_failure(container, "uninstall", &e),
        }
    }
}

/// Request shutdown, then join a watchdog task waiting for it within
/// `timeout` plus [`STOP_WATCHDOG_GRACE`].
pub async fn shutdown_framework(framework: Arc<dyn Framework>, timeout: Duration) -> ExamResult<()> {
    framework.stop().await?;
    let watched = Arc::clone(&framework);
    let watchdog = tokio::spawn(async move { watched.wait_for_stop(timeout).await });
    let stopped = match tokio::time::timeout(timeout + STOP_WATCHDOG_GRACE, watchdog).await {
        Ok(Ok(Ok(FrameworkEvent::Stopped))) => true,
        Ok(Ok(Ok(_))) | Err(_) => false,
        Ok(Ok(Err(e))) => return Err(e.into()),
        Ok(Err(join)) => return Err(ExamError::container_caused_by("shutdown watchdog failed", join)),
    };
    let state = framework.state().await?;
    if !stopped || !matches!(state, FrameworkState::Stopped | FrameworkState::Created) {
        return Err(ExamError::timeout("framework shutdown", timeout));
    }
    Ok(())
}

/// Shutdown wait after a failed start, so a start that already used up its
/// timeout reports promptly.
pub fn aborted_start_wait(timeout: Duration) -> Duration {
    timeout.min(ABORTED_START_STOP_TIMEOUT)
}

/// The invoker registered for the root of `address`.
pub async fn find_probe_invoker(
    framework: &dyn Framework,
    address: &TestAddress,
    timeout: Duration,
) -> ExamResult<ServiceReference> {
    let filter = ServiceFilter::probe_invoker(address.root().identifier());
    let references = framework.find_services(&filter, timeout).await?;
    if references.len() > 1 {
        warn!(filter = %filter, count = references.len(), "more than one probe invoker, using the first");
    }
    references
        .into_iter()
        .next()
        .ok_or_else(|| ExamError::container(format!("no probe invoker matching {filter}")))
}
