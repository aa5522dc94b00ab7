//! Reactor: collects configurations and probes, then stages them onto
//! containers according to a [`StagingStrategy`].

pub mod eager;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::address::TestAddress;
use crate::container::TestContainerFactory;
use crate::error::ExamResult;
use crate::events::TestListener;
use crate::options::ExamOption;
use crate::probe::Probe;
use crate::settings::ExamSettings;

pub use eager::{EagerStagedReactor, PerConfiguration, SharedContainer};
pub use per_test::{PerTest, PerTestStagedReactor};

/// Probe declared under one configuration.
#[derive(Debug, Clone)]
pub struct ProbeDeclaration {
    pub configuration: Arc<Vec<ExamOption>>,
    pub probe: Probe,
}

/// Everything a strategy needs to stage a reactor.
pub struct ReactorPlan {
    pub factory: Arc<dyn TestContainerFactory>,
    pub settings: ExamSettings,
    pub declarations: Vec<ProbeDeclaration>,
}

impl ReactorPlan {
    /// Union of every probe's addresses in declaration order.
    pub fn targets(&self) -> Vec<TestAddress> {
        let mut seen = HashSet::new();
        self.declarations
            .iter()
            .flat_map(|d| d.probe.addresses().iter())
            .filter(|a| seen.insert(a.identifier().to_string()))
            .cloned()
            .collect()
    }
}

/// Policy deciding how many containers serve a plan and which probes each
/// one holds.
#[async_trait]
pub trait StagingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn stage(&self, plan: ReactorPlan) -> ExamResult<Box<dyn StagedExamReactor>>;
}

/// A staged reactor: a fixed routing from addresses to containers.
#[async_trait]
pub trait StagedExamReactor: Send + Sync {
    /// Every served address, in declaration order.
    fn targets(&self) -> Vec<TestAddress>;

    /// Names of the containers this reactor started.
    fn containers(&self) -> Vec<String>;

    /// Name of the container serving `address`, if it is a target.
    fn container_for(&self, address: &TestAddress) -> Option<String>;

    /// Invoke one target; unknown addresses fail with
    /// [`ExamError::UnknownTarget`](crate::error::ExamError::UnknownTarget).
    async fn invoke(&self, address: &TestAddress) -> ExamResult<()>;

    async fn run_test(&self, address: &TestAddress, listener: Arc<dyn TestListener>) -> ExamResult<()>;

    /// Stop every started container. Individual failures are logged and do
    /// not prevent the remaining containers from stopping.
    async fn tear_down(&self);
}

pub struct ExamReactor {
    factory: Arc<dyn TestContainerFactory>,
    settings: ExamSettings,
    current: Option<Arc<Vec<ExamOption>>>,
    declarations: Vec<ProbeDeclaration>,
}

impl ExamReactor {
    pub fn new(factory: Arc<dyn TestContainerFactory>, settings: ExamSettings) -> Self {
        Self {
            factory,
            settings,
            current: None,
            declarations: Vec::new(),
        }
    }

    /// Start a new configuration; following probes are declared under it.
    pub fn add_configuration(&mut self, options: Vec<ExamOption>) -> &mut Self {
        self.current = Some(Arc::new(options));
        self
    }

    /// Declare `probe` under the most recent configuration, or an empty one
    /// if none was added.
    pub fn add_probe(&mut self, probe: Probe) -> &mut Self {
        let configuration = self
            .current
            .get_or_insert_with(|| Arc::new(Vec::new()))
            .clone();
        debug!(tests = probe.addresses().len(), digest = %probe.digest(), "added probe to reactor");
        self.declarations.push(ProbeDeclaration {
            configuration,
            probe,
        });
        self
    }

    pub fn declarations(&self) -> &[ProbeDeclaration] {
        &self.declarations
    }

    pub async fn stage(&self, strategy: &dyn StagingStrategy) -> ExamResult<Box<dyn StagedExamReactor>> {
        debug!(strategy = strategy.name(), probes = self.declarations.len(), "staging reactor");
        strategy
            .stage(ReactorPlan {
                factory: Arc::clone(&self.factory),
                settings: self.settings.clone(),
                declarations: self.declarations.clone(),
            })
            .await
    }
}
