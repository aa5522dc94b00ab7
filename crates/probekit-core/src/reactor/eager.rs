//! Eager staging: containers are started and probes installed when the
//! reactor is staged.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ReactorPlan, StagedExamReactor, StagingStrategy};
use crate::address::TestAddress;
use crate::container::{TestContainer, TestContainerFactory};
use crate::error::{ExamError, ExamResult};
use crate::events::TestListener;
use crate::options::ExamOption;
use crate::probe::Probe;
use crate::settings::ExamSettings;
use crate::system::ExamSystem;

/// One container holding a set of probes.
pub struct StageGroup {
    pub options: Vec<ExamOption>,
    pub probes: Vec<Probe>,
}

struct StagedContainer {
    name: String,
    container: Mutex<Box<dyn TestContainer>>,
}

pub struct EagerStagedReactor {
    targets: Vec<TestAddress>,
    containers: Vec<StagedContainer>,
    routes: HashMap<String, usize>,
}

impl EagerStagedReactor {
    /// Start one container per group. If any group fails, containers
    /// already started are stopped before the error is returned.
    pub async fn start(
        factory: Arc<dyn TestContainerFactory>,
        settings: ExamSettings,
        groups: Vec<StageGroup>,
        targets: Vec<TestAddress>,
    ) -> ExamResult<Self> {
        let mut reactor = Self {
            targets,
            containers: Vec::new(),
            routes: HashMap::new(),
        };
        for group in groups {
            if let Err(e) = reactor.start_group(factory.as_ref(), &settings, group).await {
                reactor.tear_down().await;
                return Err(e);
            }
        }
        info!(containers = reactor.containers.len(), targets = reactor.targets.len(), "reactor staged");
        Ok(reactor)
    }

    async fn start_group(
        &mut self,
        factory: &dyn TestContainerFactory,
        settings: &ExamSettings,
        group: StageGroup,
    ) -> ExamResult<()> {
        let system = Arc::new(ExamSystem::new(group.options, settings.clone())?);
        let mut container = factory.create(system)?;
        container.start().await?;
        let index = self.containers.len();
        let name = container.name().to_string();
        let installed = install_all(container.as_mut(), &group.probes).await;
        self.containers.push(StagedContainer {
            name,
            container: Mutex::new(container),
        });
        installed?;
        for probe in &group.probes {
            for address in probe.addresses() {
                self.routes.insert(address.identifier().to_string(), index);
            }
        }
        Ok(())
    }

    fn route(&self, address: &TestAddress) -> ExamResult<&StagedContainer> {
        let identifier = address.root().identifier();
        self.routes
            .get(identifier)
            .and_then(|i| self.containers.get(*i))
            .ok_or_else(|| ExamError::UnknownTarget(identifier.to_string()))
    }
}

async fn install_all(container: &mut dyn TestContainer, probes: &[Probe]) -> ExamResult<()> {
    for probe in probes {
        container.install_probe(probe).await?;
    }
    Ok(())
}

#[async_trait]
impl StagedExamReactor for EagerStagedReactor {
    fn targets(&self) -> Vec<TestAddress> {
        self.targets.clone()
    }

    fn containers(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.name.clone()).collect()
    }

    fn container_for(&self, address: &TestAddress) -> Option<String> {
        self.route(address).ok().map(|c| c.name.clone())
    }

    async fn invoke(&self, address: &TestAddress) -> ExamResult<()> {
        let staged = self.route(address)?;
        staged.container.lock().await.call(address).await
    }

    async fn run_test(&self, address: &TestAddress, listener: Arc<dyn TestListener>) -> ExamResult<()> {
        let staged = self.route(address)?;
        staged.container.lock().await.run_test(address, listener).await
    }

    async fn tear_down(&self) {
        for staged in &self.containers {
            if let Err(e) = staged.container.lock().await.stop().await {
                warn!(container = %staged.name, error = %e, "container failed to stop during tear down");
            }
        }
    }
}

/// All configurations share one container holding every probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedContainer;

/// Every declared configuration gets its own container.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerConfiguration;

/// Options of every configuration, each distinct option once, in
/// declaration order. For single-valued kinds the first declaration wins.
fn merged_options(plan: &ReactorPlan) -> Vec<ExamOption> {
    let mut merged: Vec<ExamOption> = Vec::new();
    let mut seen = Vec::new();
    for declaration in &plan.declarations {
        if seen.iter().any(|c| Arc::ptr_eq(c, &declaration.configuration)) {
            continue;
        }
        seen.push(Arc::clone(&declaration.configuration));
        for option in declaration.configuration.iter() {
            if merged.contains(option) {
                continue;
            }
            let kind = option.kind();
            if !kind.allows_multiple() {
                if let Some(kept) = merged.iter().find(|o| o.kind() == kind) {
                    debug!(kind = %kind, kept = ?kept, dropped = ?option, "shared container keeps the first declaration");
                    continue;
                }
            }
            merged.push(option.clone());
        }
    }
    merged
}

#[async_trait]
impl StagingStrategy for SharedContainer {
    fn name(&self) -> &'static str {
        "shared-container"
    }

    async fn stage(&self, plan: ReactorPlan) -> ExamResult<Box<dyn StagedExamReactor>> {
        let targets = plan.targets();
        let groups = if plan.declarations.is_empty() {
            Vec::new()
        } else {
            vec![StageGroup {
                options: merged_options(&plan),
                probes: plan.declarations.iter().map(|d| d.probe.clone()).collect(),
            }]
        };
        let reactor = EagerStagedReactor::start(plan.factory, plan.settings, groups, targets).await?;
        Ok(Box::new(reactor))
    }
}

#[async_trait]
impl StagingStrategy for PerConfiguration {
    fn name(&self) -> &'static str {
        "per-configuration"
    }

    async fn stage(&self, plan: ReactorPlan) -> ExamResult<Box<dyn StagedExamReactor>> {
        let targets = plan.targets();
        let groups = plan
            .declarations
            .iter()
            .map(|d| StageGroup {
                options: d.configuration.as_ref().clone(),
                probes: vec![d.probe.clone()],
            })
            .collect();
        let reactor = EagerStagedReactor::start(plan.factory, plan.settings, groups, targets).await?;
        Ok(Box::new(reactor))
    }
}
