//! Fluent driver: declare options and tests, stage them, invoke every
//! target and tear down.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::address::TestAddress;
use crate::container::TestContainerFactory;
use crate::error::{ExamError, ExamResult, TestFailure};
use crate::options::ExamOption;
use crate::probe::ProbeBuilder;
use crate::reactor::{ExamReactor, StagingStrategy};
use crate::settings::ExamSettings;

/// Failure kind recorded when an invocation fails outside the test itself.
pub const FAILURE_KIND_CONTAINER: &str = "container";

/// Outcome of one played target.
#[derive(Debug, Clone)]
pub struct PlayOutcome {
    pub address: TestAddress,
    pub result: Result<(), TestFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct PlayReport {
    pub outcomes: Vec<PlayOutcome>,
}

impl PlayReport {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> Vec<&PlayOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Outcome for the test declared with `caption` (`owner.method`).
    pub fn outcome(&self, caption: &str) -> Option<&PlayOutcome> {
        self.outcomes.iter().find(|o| o.address.caption() == caption)
    }
}

struct Declared {
    owner: String,
    method: String,
    arguments: Vec<Value>,
}

pub struct Player {
    factory: Arc<dyn TestContainerFactory>,
    settings: ExamSettings,
    options: Vec<ExamOption>,
    tests: Vec<Declared>,
}

impl Player {
    pub fn new(factory: Arc<dyn TestContainerFactory>) -> Self {
        Self {
            factory,
            settings: ExamSettings::default(),
            options: Vec::new(),
            tests: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: ExamSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with(mut self, options: impl IntoIterator<Item = ExamOption>) -> Self {
        self.options.extend(options);
        self
    }

    pub fn test(mut self, owner: &str, method: &str, arguments: Vec<Value>) -> Self {
        self.tests.push(Declared {
            owner: owner.to_string(),
            method: method.to_string(),
            arguments,
        });
        self
    }

    /// Stage with `strategy`, invoke every target in order and tear down.
    /// Staging errors are returned; per-target errors land in the report.
    pub async fn play(self, strategy: &dyn StagingStrategy) -> ExamResult<PlayReport> {
        let mut builder = ProbeBuilder::new();
        for test in &self.tests {
            builder.add_test(&test.owner, &test.method, test.arguments.clone())?;
        }
        let probe = builder.build()?;

        let mut reactor = ExamReactor::new(self.factory, self.settings);
        reactor.add_configuration(self.options).add_probe(probe);
        let staged = reactor.stage(strategy).await?;

        let mut report = PlayReport::default();
        for address in staged.targets() {
            let result = match staged.invoke(&address).await {
                Ok(()) => Ok(()),
                Err(ExamError::Invocation(failure)) => Err(failure),
                Err(e) => {
                    warn!(test = %address, error = %e, "invocation failed outside the test");
                    Err(TestFailure::new(FAILURE_KIND_CONTAINER, e.to_string()))
                }
            };
            report.outcomes.push(PlayOutcome { address, result });
        }
        staged.tear_down().await;
        info!(
            strategy = strategy.name(),
            passed = report.passed(),
            failed = report.failed().len(),
            "play finished"
        );
        Ok(report)
    }
}
