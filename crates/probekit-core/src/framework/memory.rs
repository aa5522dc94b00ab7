//! In-memory runtime: the reference implementation of [`Framework`].
//!
//! Units are [`ArtifactArchive`] images. Imports resolve against system
//! packages, boot delegation, packages of the linked [`Catalog`] and the
//! exports of other installed units. Start-level changes and shutdown run
//! as background tasks and report progress through events.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::extender::{BundleExtender, ProbeExtender, StartedBundle};
use super::registry::ServiceRegistry;
use super::{
    package_list, BundleId, BundleInfo, BundleState, Framework, FrameworkError, FrameworkEvent,
    FrameworkFactory, FrameworkResult, FrameworkState, ServiceReference,
};
use crate::archive::ArtifactArchive;
use crate::catalog::{ActivatorContext, Catalog};
use crate::constants::{
    FRAMEWORK_BOOTDELEGATION, FRAMEWORK_STORAGE, FRAMEWORK_STORAGE_CLEAN,
    FRAMEWORK_STORAGE_CLEAN_ONFIRSTINIT, FRAMEWORK_SYSTEMPACKAGES_EXTRA, HEADER_ACTIVATOR,
    HEADER_EXPORT_PACKAGE, HEADER_IMPORT_PACKAGE, HEADER_SYMBOLIC_NAME, HEADER_VERSION,
};
use crate::filter::ServiceFilter;

const BEGINNING_START_LEVEL: u32 = 1;
const INITIAL_BUNDLE_START_LEVEL: u32 = 1;
const EVENT_CAPACITY: usize = 256;

struct BundleEntry {
    info: BundleInfo,
    archive: ArtifactArchive,
    autostart: bool,
}

#[derive(Default)]
struct Inner {
    bundles: BTreeMap<BundleId, BundleEntry>,
    next_id: BundleId,
    active_level: u32,
    level_task: Option<JoinHandle<()>>,
}

struct Shared {
    properties: BTreeMap<String, String>,
    catalog: Catalog,
    extenders: Vec<Arc<dyn BundleExtender>>,
    level_step_delay: Duration,
    registry: Arc<ServiceRegistry>,
    events: broadcast::Sender<FrameworkEvent>,
    state: watch::Sender<FrameworkState>,
    inner: Mutex<Inner>,
}

pub struct MemoryFramework {
    shared: Arc<Shared>,
}

impl MemoryFramework {
    pub fn new(properties: BTreeMap<String, String>, catalog: Catalog) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(FrameworkState::Created);
        Self {
            shared: Arc::new(Shared {
                properties,
                catalog,
                extenders: Vec::new(),
                level_step_delay: Duration::ZERO,
                registry: Arc::new(ServiceRegistry::new()),
                events,
                state,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    fn shared_mut(&mut self) -> Option<&mut Shared> {
        Arc::get_mut(&mut self.shared)
    }

    pub fn with_extender(mut self, extender: Arc<dyn BundleExtender>) -> Self {
        if let Some(shared) = self.shared_mut() {
            shared.extenders.push(extender);
        }
        self
    }

    /// Pause before each start-level step, simulating slow activation.
    pub fn with_level_step_delay(mut self, delay: Duration) -> Self {
        if let Some(shared) = self.shared_mut() {
            shared.level_step_delay = delay;
        }
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.shared.properties.get(key).map(String::as_str)
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.shared.registry
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_state(&self) -> FrameworkState {
        *self.state.borrow()
    }

    fn set_state(&self, state: FrameworkState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: FrameworkEvent) {
        let _ = self.events.send(event);
    }

    fn bundle_label(&self, id: BundleId) -> String {
        self.lock()
            .bundles
            .get(&id)
            .map(|b| b.info.to_string())
            .unwrap_or_else(|| format!("#{id}"))
    }

    fn provided_packages(&self, inner: &Inner) -> BTreeSet<String> {
        let mut packages: BTreeSet<String> = package_list(
            self.properties
                .get(FRAMEWORK_SYSTEMPACKAGES_EXTRA)
                .map(String::as_str),
        )
        .into_iter()
        .collect();
        packages.extend(self.catalog.exported_packages());
        for entry in inner.bundles.values() {
            if entry.info.state != BundleState::Uninstalled {
                packages.extend(package_list(entry.archive.header(HEADER_EXPORT_PACKAGE)));
            }
        }
        packages
    }

    fn boot_delegated(&self, package: &str) -> bool {
        package_list(self.properties.get(FRAMEWORK_BOOTDELEGATION).map(String::as_str))
            .iter()
            .any(|pattern| match pattern.strip_suffix('*') {
                Some("") => true,
                Some(prefix) => package.starts_with(prefix),
                None => pattern == package,
            })
    }

    fn missing_imports(&self, inner: &Inner, id: BundleId) -> Vec<String> {
        let Some(entry) = inner.bundles.get(&id) else {
            return Vec::new();
        };
        let provided = self.provided_packages(inner);
        package_list(entry.archive.header(HEADER_IMPORT_PACKAGE))
            .into_iter()
            .filter(|p| !provided.contains(p) && !self.boot_delegated(p))
            .collect()
    }

    /// Move every resolvable `Installed` unit to `Resolved`.
    fn resolve_installed(&self) {
        let mut inner = self.lock();
        let candidates: Vec<BundleId> = inner
            .bundles
            .iter()
            .filter(|(_, b)| b.info.state == BundleState::Installed)
            .map(|(id, _)| *id)
            .collect();
        for id in candidates {
            if self.missing_imports(&inner, id).is_empty() {
                if let Some(entry) = inner.bundles.get_mut(&id) {
                    entry.info.state = BundleState::Resolved;
                }
            }
        }
    }

    fn activate(&self, id: BundleId) -> FrameworkResult<()> {
        let (info, archive) = {
            let mut inner = self.lock();
            let missing = self.missing_imports(&inner, id);
            let entry = inner
                .bundles
                .get_mut(&id)
                .ok_or(FrameworkError::UnknownBundle { id })?;
            match entry.info.state {
                BundleState::Active | BundleState::Starting => return Ok(()),
                BundleState::Uninstalled => return Err(FrameworkError::UnknownBundle { id }),
                _ => {}
            }
            if !missing.is_empty() {
                entry.info.state = BundleState::Installed;
                return Err(FrameworkError::Resolve {
                    bundle: entry.info.to_string(),
                    missing,
                });
            }
            entry.info.state = BundleState::Starting;
            (entry.info.clone(), entry.archive.clone())
        };

        if let Some(name) = archive.header(HEADER_ACTIVATOR).filter(|n| !n.trim().is_empty()) {
            let result = match self.catalog.activator(name.trim()) {
                Some(activator) => activator(&ActivatorContext {
                    symbolic_name: info.symbolic_name.clone(),
                    properties: self.properties.clone(),
                }),
                None => Err(format!("no activator named {name} is linked")),
            };
            if let Err(message) = result {
                self.set_bundle_state(id, BundleState::Resolved);
                return Err(FrameworkError::Activator {
                    bundle: info.to_string(),
                    message,
                });
            }
        }

        self.set_bundle_state(id, BundleState::Active);
        let info = BundleInfo {
            state: BundleState::Active,
            ..info
        };
        debug!(bundle = %info, "bundle active");

        for extender in &self.extenders {
            let started = StartedBundle {
                info: &info,
                archive: &archive,
                properties: &self.properties,
                services: &self.registry,
            };
            if let Err(e) = extender.bundle_started(&started) {
                warn!(bundle = %info, error = %e, "extender failed for bundle");
                self.emit(FrameworkEvent::Error {
                    bundle: id,
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn deactivate(&self, id: BundleId) {
        let was_active = {
            let mut inner = self.lock();
            match inner.bundles.get_mut(&id) {
                Some(entry) if entry.info.state == BundleState::Active => {
                    entry.info.state = BundleState::Stopping;
                    true
                }
                _ => false,
            }
        };
        if was_active {
            self.registry.unregister_owner(id);
            self.set_bundle_state(id, BundleState::Resolved);
            debug!(bundle = id, "bundle stopped");
        }
    }

    fn set_bundle_state(&self, id: BundleId, state: BundleState) {
        if let Some(entry) = self.lock().bundles.get_mut(&id) {
            entry.info.state = state;
        }
    }

    /// Activate autostart units assigned to `level`, reporting failures as
    /// events.
    fn activate_level(&self, level: u32) {
        let ids: Vec<BundleId> = self
            .lock()
            .bundles
            .values()
            .filter(|b| b.autostart && b.info.start_level == level)
            .map(|b| b.info.id)
            .collect();
        for id in ids {
            if let Err(e) = self.activate(id) {
                warn!(bundle = id, error = %e, "bundle failed to start");
                self.emit(FrameworkEvent::Error {
                    bundle: id,
                    message: e.to_string(),
                });
            }
        }
        self.resolve_installed();
    }

    fn deactivate_level(&self, level: u32) {
        let ids: Vec<BundleId> = self
            .lock()
            .bundles
            .values()
            .rev()
            .filter(|b| b.info.start_level == level)
            .map(|b| b.info.id)
            .collect();
        for id in ids {
            self.deactivate(id);
        }
    }

    /// Step one level at a time until `target`; returns when reached.
    async fn step_to(&self, target: u32) {
        loop {
            let current = self.lock().active_level;
            if current == target {
                return;
            }
            if self.level_step_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.level_step_delay).await;
            }
            let next = if current < target {
                let next = current + 1;
                self.lock().active_level = next;
                self.activate_level(next);
                next
            } else {
                self.deactivate_level(current);
                let next = current - 1;
                self.lock().active_level = next;
                next
            };
            debug!(level = next, "start level changed");
            self.emit(FrameworkEvent::StartLevelChanged { level: next });
        }
    }

    fn abort_level_task(&self) {
        if let Some(task) = self.lock().level_task.take() {
            task.abort();
        }
    }

    fn load(&self, location: &str, content: Option<Vec<u8>>) -> FrameworkResult<ArtifactArchive> {
        let install_error = |reason: String| FrameworkError::Install {
            location: location.to_string(),
            reason,
        };
        let bytes = match content {
            Some(bytes) => bytes,
            None => {
                let path = location
                    .strip_prefix("reference:")
                    .unwrap_or(location)
                    .strip_prefix("file:")
                    .ok_or_else(|| install_error("unsupported location scheme".to_string()))?;
                std::fs::read(PathBuf::from(path)).map_err(|e| install_error(e.to_string()))?
            }
        };
        ArtifactArchive::from_bytes(&bytes).map_err(|e| install_error(e.to_string()))
    }

    fn prepare_storage(&self) -> FrameworkResult<()> {
        let Some(storage) = self.properties.get(FRAMEWORK_STORAGE) else {
            return Ok(());
        };
        let clean = self.properties.get(FRAMEWORK_STORAGE_CLEAN).map(String::as_str)
            == Some(FRAMEWORK_STORAGE_CLEAN_ONFIRSTINIT);
        let path = PathBuf::from(storage);
        if clean && path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(())
    }
}

#[async_trait]
impl Framework for MemoryFramework {
    async fn init(&self) -> FrameworkResult<()> {
        match self.shared.current_state() {
            FrameworkState::Created | FrameworkState::Stopped => {
                self.shared.prepare_storage()?;
                self.shared.set_state(FrameworkState::Initialized);
                Ok(())
            }
            FrameworkState::Initialized | FrameworkState::Active => Ok(()),
            state => Err(FrameworkError::InvalidState {
                state,
                expected: "created or stopped".into(),
            }),
        }
    }

    async fn start(&self) -> FrameworkResult<()> {
        match self.shared.current_state() {
            FrameworkState::Active => return Ok(()),
            FrameworkState::Created | FrameworkState::Stopped => self.init().await?,
            _ => {}
        }
        self.shared.set_state(FrameworkState::Active);
        self.shared.lock().active_level = BEGINNING_START_LEVEL;
        self.shared.activate_level(BEGINNING_START_LEVEL);
        info!(level = BEGINNING_START_LEVEL, "in-memory framework started");
        self.shared.emit(FrameworkEvent::Started);
        self.shared.emit(FrameworkEvent::StartLevelChanged {
            level: BEGINNING_START_LEVEL,
        });
        Ok(())
    }

    async fn stop(&self) -> FrameworkResult<()> {
        match self.shared.current_state() {
            FrameworkState::Active | FrameworkState::Initialized => {}
            _ => return Ok(()),
        }
        self.shared.abort_level_task();
        self.shared.set_state(FrameworkState::Stopping);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.step_to(0).await;
            {
                let mut inner = shared.lock();
                for entry in inner.bundles.values_mut() {
                    if entry.info.state == BundleState::Active {
                        entry.info.state = BundleState::Resolved;
                    }
                }
            }
            let ids: Vec<BundleId> = shared.lock().bundles.keys().copied().collect();
            for id in ids {
                shared.registry.unregister_owner(id);
            }
            shared.set_state(FrameworkState::Stopped);
            info!("in-memory framework stopped");
            shared.emit(FrameworkEvent::Stopped);
        });
        Ok(())
    }

    async fn wait_for_stop(&self, timeout: Duration) -> FrameworkResult<FrameworkEvent> {
        let mut state = self.shared.state.subscribe();
        let stopped = tokio::time::timeout(timeout, async {
            state
                .wait_for(|s| matches!(s, FrameworkState::Stopped | FrameworkState::Created))
                .await
                .is_ok()
        })
        .await;
        match stopped {
            Ok(true) => Ok(FrameworkEvent::Stopped),
            Ok(false) | Err(_) => Ok(FrameworkEvent::WaitTimedOut),
        }
    }

    async fn state(&self) -> FrameworkResult<FrameworkState> {
        Ok(self.shared.current_state())
    }

    async fn install_bundle(&self, location: &str, content: Option<Vec<u8>>) -> FrameworkResult<BundleId> {
        match self.shared.current_state() {
            FrameworkState::Initialized | FrameworkState::Active => {}
            state => {
                return Err(FrameworkError::InvalidState {
                    state,
                    expected: "initialized or active".into(),
                })
            }
        }
        if let Some(existing) = self
            .shared
            .lock()
            .bundles
            .values()
            .find(|b| b.info.location == location)
        {
            return Ok(existing.info.id);
        }

        let archive = self.shared.load(location, content)?;
        let symbolic_name = archive
            .header(HEADER_SYMBOLIC_NAME)
            .map(|n| n.split(';').next().unwrap_or_default().trim().to_string())
            .unwrap_or_default();
        let version = archive
            .header(HEADER_VERSION)
            .unwrap_or("0.0.0")
            .trim()
            .to_string();

        let mut inner = self.shared.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let info = BundleInfo {
            id,
            location: location.to_string(),
            symbolic_name,
            version,
            state: BundleState::Installed,
            start_level: INITIAL_BUNDLE_START_LEVEL,
        };
        debug!(bundle = %info, "installed bundle");
        inner.bundles.insert(
            id,
            BundleEntry {
                info,
                archive,
                autostart: false,
            },
        );
        Ok(id)
    }

    async fn update_bundle(&self, id: BundleId, content: Option<Vec<u8>>) -> FrameworkResult<()> {
        let location = self.bundle_info(id).await?.location;
        let archive = self.shared.load(&location, content)?;
        self.shared.deactivate(id);
        let restart = {
            let mut inner = self.shared.lock();
            let active_level = inner.active_level;
            let entry = inner
                .bundles
                .get_mut(&id)
                .ok_or(FrameworkError::UnknownBundle { id })?;
            entry.archive = archive;
            entry.info.state = BundleState::Installed;
            entry.autostart && entry.info.start_level <= active_level
        };
        debug!(bundle = id, "updated bundle");
        if restart && self.shared.current_state() == FrameworkState::Active {
            self.shared.activate(id)?;
        }
        Ok(())
    }

    async fn start_bundle(&self, id: BundleId) -> FrameworkResult<()> {
        let eligible = {
            let mut inner = self.shared.lock();
            let active_level = inner.active_level;
            let entry = inner
                .bundles
                .get_mut(&id)
                .ok_or(FrameworkError::UnknownBundle { id })?;
            entry.autostart = true;
            entry.info.start_level <= active_level
        };
        if eligible && self.shared.current_state() == FrameworkState::Active {
            self.shared.activate(id)?;
        }
        Ok(())
    }

    async fn uninstall_bundle(&self, id: BundleId) -> FrameworkResult<()> {
        if !self.shared.lock().bundles.contains_key(&id) {
            return Err(FrameworkError::UnknownBundle { id });
        }
        self.shared.deactivate(id);
        let label = self.shared.bundle_label(id);
        self.shared.lock().bundles.remove(&id);
        debug!(bundle = %label, "uninstalled bundle");
        Ok(())
    }

    async fn bundle_state(&self, id: BundleId) -> FrameworkResult<BundleState> {
        Ok(self.bundle_info(id).await?.state)
    }

    async fn bundle_info(&self, id: BundleId) -> FrameworkResult<BundleInfo> {
        self.shared
            .lock()
            .bundles
            .get(&id)
            .map(|b| b.info.clone())
            .ok_or(FrameworkError::UnknownBundle { id })
    }

    async fn bundles(&self) -> FrameworkResult<Vec<BundleInfo>> {
        Ok(self
            .shared
            .lock()
            .bundles
            .values()
            .map(|b| b.info.clone())
            .collect())
    }

    async fn set_bundle_start_level(&self, id: BundleId, level: u32) -> FrameworkResult<()> {
        let mut inner = self.shared.lock();
        let entry = inner
            .bundles
            .get_mut(&id)
            .ok_or(FrameworkError::UnknownBundle { id })?;
        entry.info.start_level = level;
        Ok(())
    }

    async fn set_start_level(&self, level: u32) -> FrameworkResult<()> {
        let state = self.shared.current_state();
        if state != FrameworkState::Active {
            return Err(FrameworkError::InvalidState {
                state,
                expected: "active".into(),
            });
        }
        self.shared.abort_level_task();
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move { shared.step_to(level).await });
        self.shared.lock().level_task = Some(task);
        Ok(())
    }

    async fn start_level(&self) -> FrameworkResult<u32> {
        Ok(self.shared.lock().active_level)
    }

    fn subscribe(&self) -> broadcast::Receiver<FrameworkEvent> {
        self.shared.events.subscribe()
    }

    async fn find_services(
        &self,
        filter: &ServiceFilter,
        timeout: Duration,
    ) -> FrameworkResult<Vec<ServiceReference>> {
        let found = self.shared.registry.wait_for(filter, timeout).await;
        if found.is_empty() {
            return Err(FrameworkError::ServiceNotFound {
                filter: filter.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(found)
    }

    async fn invoke_service(
        &self,
        reference: &ServiceReference,
        method: &str,
        args: Vec<Value>,
    ) -> FrameworkResult<Value> {
        let service = self
            .shared
            .registry
            .get(reference.id)
            .ok_or(FrameworkError::UnknownService { id: reference.id })?;
        service.invoke(method, args).await
    }
}

/// Builds [`MemoryFramework`] instances sharing one catalog and extender set.
#[derive(Clone, Default)]
pub struct MemoryFrameworkFactory {
    catalog: Catalog,
    extenders: Vec<Arc<dyn BundleExtender>>,
    level_step_delay: Duration,
}

impl MemoryFrameworkFactory {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            ..Default::default()
        }
    }

    /// Factory whose runtimes register probe invokers for `catalog`.
    pub fn with_probes(catalog: Catalog) -> Self {
        Self::new(catalog.clone()).with_extender(Arc::new(ProbeExtender::new(catalog)))
    }

    pub fn with_extender(mut self, extender: Arc<dyn BundleExtender>) -> Self {
        self.extenders.push(extender);
        self
    }

    pub fn with_level_step_delay(mut self, delay: Duration) -> Self {
        self.level_step_delay = delay;
        self
    }

    pub fn build(&self, properties: BTreeMap<String, String>) -> MemoryFramework {
        let mut framework = MemoryFramework::new(properties, self.catalog.clone())
            .with_level_step_delay(self.level_step_delay);
        for extender in &self.extenders {
            framework = framework.with_extender(Arc::clone(extender));
        }
        framework
    }
}

impl FrameworkFactory for MemoryFrameworkFactory {
    fn new_framework(&self, properties: BTreeMap<String, String>) -> FrameworkResult<Arc<dyn Framework>> {
        Ok(Arc::new(self.build(properties)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveBuilder;

    fn unit(name: &str) -> ArchiveBuilder {
        ArchiveBuilder::named(name, "1.0.0")
    }

    fn bytes(builder: ArchiveBuilder) -> Option<Vec<u8>> {
        Some(builder.build().to_bytes().unwrap())
    }

    async fn started(framework: &MemoryFramework) {
        framework.init().await.unwrap();
        framework.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_install_requires_init() {
        let framework = MemoryFramework::new(BTreeMap::new(), Catalog::new());
        let err = framework
            .install_bundle("mem:a", bytes(unit("a")))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameworkError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_imports_resolve_against_exports_and_system_packages() {
        let properties = BTreeMap::from([(
            FRAMEWORK_SYSTEMPACKAGES_EXTRA.to_string(),
            "acme.sys".to_string(),
        )]);
        let framework = MemoryFramework::new(properties, Catalog::new());
        started(&framework).await;

        let api = framework
            .install_bundle("mem:api", bytes(unit("acme.api").header(HEADER_EXPORT_PACKAGE, "acme.api")))
            .await
            .unwrap();
        let client = framework
            .install_bundle(
                "mem:client",
                bytes(unit("acme.client").header(HEADER_IMPORT_PACKAGE, "acme.api,acme.sys")),
            )
            .await
            .unwrap();
        let orphan = framework
            .install_bundle(
                "mem:orphan",
                bytes(unit("acme.orphan").header(HEADER_IMPORT_PACKAGE, "acme.missing")),
            )
            .await
            .unwrap();

        framework.start_bundle(api).await.unwrap();
        framework.start_bundle(client).await.unwrap();
        let err = framework.start_bundle(orphan).await.unwrap_err();
        assert!(err.to_string().contains("acme.missing"));

        assert_eq!(framework.bundle_state(client).await.unwrap(), BundleState::Active);
        assert_eq!(framework.bundle_state(orphan).await.unwrap(), BundleState::Installed);
    }

    #[tokio::test]
    async fn test_boot_delegation_wildcard() {
        let properties = BTreeMap::from([(FRAMEWORK_BOOTDELEGATION.to_string(), "acme.boot.*".to_string())]);
        let framework = MemoryFramework::new(properties, Catalog::new());
        started(&framework).await;
        let id = framework
            .install_bundle("mem:a", bytes(unit("a").header(HEADER_IMPORT_PACKAGE, "acme.boot.util")))
            .await
            .unwrap();
        framework.start_bundle(id).await.unwrap();
        assert_eq!(framework.bundle_state(id).await.unwrap(), BundleState::Active);
    }

    #[tokio::test]
    async fn test_start_level_activates_deferred_bundles() {
        let framework = MemoryFramework::new(BTreeMap::new(), Catalog::new());
        started(&framework).await;
        let id = framework.install_bundle("mem:late", bytes(unit("late"))).await.unwrap();
        framework.set_bundle_start_level(id, 5).await.unwrap();
        framework.start_bundle(id).await.unwrap();
        assert_eq!(framework.bundle_state(id).await.unwrap(), BundleState::Installed);

        assert!(framework
            .set_start_level_and_wait(5, Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(framework.start_level().await.unwrap(), 5);
        assert_eq!(framework.bundle_state(id).await.unwrap(), BundleState::Active);
    }

    #[tokio::test]
    async fn test_slow_levels_time_out() {
        let framework = MemoryFramework::new(BTreeMap::new(), Catalog::new())
            .with_level_step_delay(Duration::from_secs(30));
        started(&framework).await;
        let reached = framework
            .set_start_level_and_wait(15, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!reached);
    }

    #[tokio::test]
    async fn test_activator_failure_keeps_bundle_resolved() {
        let catalog = Catalog::new().with_activator("acme.Fails", |_| Err("refused".to_string()));
        let framework = MemoryFramework::new(BTreeMap::new(), catalog);
        started(&framework).await;
        let id = framework
            .install_bundle("mem:a", bytes(unit("a").header(HEADER_ACTIVATOR, "acme.Fails")))
            .await
            .unwrap();
        let err = framework.start_bundle(id).await.unwrap_err();
        assert!(matches!(err, FrameworkError::Activator { .. }));
        assert_eq!(framework.bundle_state(id).await.unwrap(), BundleState::Resolved);
    }

    #[tokio::test]
    async fn test_install_from_file_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pkar");
        unit("acme.file").write_to(&path).unwrap();

        let framework = MemoryFramework::new(BTreeMap::new(), Catalog::new());
        framework.init().await.unwrap();
        let location = format!("reference:file:{}", path.display());
        let id = framework.install_bundle(&location, None).await.unwrap();
        assert_eq!(framework.bundle_info(id).await.unwrap().symbolic_name, "acme.file");
        assert_eq!(framework.install_bundle(&location, None).await.unwrap(), id);

        let err = framework.install_bundle("http://nowhere/a", None).await.unwrap_err();
        assert!(matches!(err, FrameworkError::Install { .. }));
    }

    #[tokio::test]
    async fn test_stop_completes_and_is_observable() {
        let framework = MemoryFramework::new(BTreeMap::new(), Catalog::new());
        started(&framework).await;
        let id = framework.install_bundle("mem:a", bytes(unit("a"))).await.unwrap();
        framework.start_bundle(id).await.unwrap();

        framework.stop().await.unwrap();
        let event = framework.wait_for_stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event, FrameworkEvent::Stopped);
        assert_eq!(framework.state().await.unwrap(), FrameworkState::Stopped);
        assert_eq!(framework.bundle_state(id).await.unwrap(), BundleState::Resolved);
    }

    #[tokio::test]
    async fn test_uninstall_unknown_bundle_fails() {
        let framework = MemoryFramework::new(BTreeMap::new(), Catalog::new());
        started(&framework).await;
        assert!(framework.uninstall_bundle(42).await.is_err());
    }

    #[tokio::test]
    async fn test_clean_storage_on_first_init() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("storage");
        std::fs::create_dir_all(&storage).unwrap();
        std::fs::write(storage.join("stale"), b"x").unwrap();
        let properties = BTreeMap::from([
            (FRAMEWORK_STORAGE.to_string(), storage.display().to_string()),
            (
                FRAMEWORK_STORAGE_CLEAN.to_string(),
                FRAMEWORK_STORAGE_CLEAN_ONFIRSTINIT.to_string(),
            ),
        ]);
        let framework = MemoryFramework::new(properties, Catalog::new());
        framework.init().await.unwrap();
        assert!(storage.exists());
        assert!(!storage.join("stale").exists());
    }
}
