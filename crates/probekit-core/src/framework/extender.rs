//! Probe extender: turns started probe units into invoker services.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::registry::ServiceRegistry;
use super::{BundleInfo, FrameworkError, FrameworkResult, Service};
use crate::address::{TestDescription, TestInstantiationInstruction};
use crate::archive::ArtifactArchive;
use crate::catalog::{Catalog, TestContext, TestFn};
use crate::constants::{HEADER_EXECUTABLE, OBJECT_CLASS, PROBE_INVOKER_CLASS, PROBE_SIGNATURE_KEY};
use crate::error::TestFailure;
use crate::events::{EventNotifier, TestEvent};
use crate::probe::decode_table;

pub const METHOD_CALL: &str = "call";
pub const METHOD_RUN_TEST: &str = "run_test";

/// A unit that has just become active.
pub struct StartedBundle<'a> {
    pub info: &'a BundleInfo,
    pub archive: &'a ArtifactArchive,
    pub properties: &'a BTreeMap<String, String>,
    pub services: &'a Arc<ServiceRegistry>,
}

/// Reacts to units becoming active. Services registered on behalf of a unit
/// are dropped by the runtime when the unit stops.
pub trait BundleExtender: Send + Sync {
    fn bundle_started(&self, bundle: &StartedBundle<'_>) -> FrameworkResult<()>;
}

/// Registers one [`ProbeInvoker`] per address table entry, tagged with the
/// entry's identifier.
#[derive(Debug, Clone)]
pub struct ProbeExtender {
    catalog: Catalog,
    invoker_port: Option<u16>,
}

impl ProbeExtender {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            invoker_port: None,
        }
    }

    /// Port of the listener that receives `run_test` outcome events.
    pub fn with_invoker_port(mut self, port: u16) -> Self {
        self.invoker_port = Some(port);
        self
    }
}

impl BundleExtender for ProbeExtender {
    fn bundle_started(&self, bundle: &StartedBundle<'_>) -> FrameworkResult<()> {
        let Some(header) = bundle.archive.header(HEADER_EXECUTABLE) else {
            return Ok(());
        };
        let table = decode_table(header).map_err(|e| FrameworkError::Activator {
            bundle: bundle.info.to_string(),
            message: e.to_string(),
        })?;

        for entry in table {
            let test = self.catalog.test(&entry.instruction);
            if test.is_none() {
                warn!(instruction = %entry.instruction, "probe entry has no linked test");
            }
            let invoker = ProbeInvoker {
                instruction: entry.instruction,
                test,
                properties: bundle.properties.clone(),
                invoker_port: self.invoker_port,
            };
            let properties = BTreeMap::from([
                (OBJECT_CLASS.to_string(), PROBE_INVOKER_CLASS.to_string()),
                (PROBE_SIGNATURE_KEY.to_string(), entry.identifier.clone()),
            ]);
            bundle
                .services
                .register(bundle.info.id, properties, Arc::new(invoker));
            debug!(identifier = %entry.identifier, "registered probe invoker");
        }
        Ok(())
    }
}

/// Runs one linked test function.
///
/// `call(args...)` runs the test and fails with the test's own failure.
/// `run_test(description, [args...])` additionally reports start and outcome
/// to the invoker port.
pub struct ProbeInvoker {
    instruction: TestInstantiationInstruction,
    test: Option<TestFn>,
    properties: BTreeMap<String, String>,
    invoker_port: Option<u16>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked".to_string()
    }
}

impl ProbeInvoker {
    async fn execute(&self, arguments: Vec<Value>) -> Result<(), TestFailure> {
        let Some(test) = self.test.clone() else {
            return Err(TestFailure::new(
                "unlinked",
                format!("no test linked for {}", self.instruction),
            ));
        };
        let context = TestContext {
            arguments,
            properties: self.properties.clone(),
        };
        match tokio::task::spawn_blocking(move || test(&context)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TestFailure::panic(panic_message(e.into_panic()))),
            Err(e) => Err(TestFailure::new("cancelled", e.to_string())),
        }
    }

    async fn run_test(&self, args: Vec<Value>) -> FrameworkResult<Value> {
        let invalid = |reason: String| FrameworkError::InvalidArguments {
            method: METHOD_RUN_TEST.to_string(),
            reason,
        };
        let mut args = args.into_iter();
        let description: TestDescription = args
            .next()
            .ok_or_else(|| invalid("missing test description".to_string()))
            .and_then(|v| serde_json::from_value(v).map_err(|e| invalid(e.to_string())))?;
        let arguments = match args.next() {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => return Err(invalid(format!("arguments must be an array, got {other}"))),
        };
        let port = self.invoker_port.ok_or_else(|| FrameworkError::Transport {
            message: "no invoker port configured for test outcome reporting".to_string(),
        })?;

        let transport = |e: crate::error::ExamError| FrameworkError::Transport {
            message: e.to_string(),
        };
        let mut notifier = EventNotifier::connect(port).await.map_err(transport)?;
        notifier
            .send(&TestEvent::started(description.clone()))
            .await
            .map_err(transport)?;
        let outcome = self.execute(arguments).await;
        let event = match &outcome {
            Ok(()) => TestEvent::succeeded(description.clone()),
            Err(failure) => TestEvent::failed(description.clone(), failure.clone()),
        };
        notifier.send(&event).await.map_err(transport)?;
        info!(test = %description, success = outcome.is_ok(), "reported test outcome");
        Ok(Value::Null)
    }
}

#[async_trait]
impl Service for ProbeInvoker {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> FrameworkResult<Value> {
        match method {
            METHOD_CALL => self
                .execute(args)
                .await
                .map(|()| Value::Null)
                .map_err(FrameworkError::Invocation),
            METHOD_RUN_TEST => self.run_test(args).await,
            other => Err(FrameworkError::UnknownMethod {
                method: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveBuilder;
    use crate::filter::ServiceFilter;
    use crate::framework::BundleState;
    use crate::probe::ProbeBuilder;
    use crate::wire::read_frame;
    use serde_json::json;
    use std::time::Duration;

    fn info() -> BundleInfo {
        BundleInfo {
            id: 7,
            location: "local:probe".into(),
            symbolic_name: String::new(),
            version: "0.0.0".into(),
            state: BundleState::Active,
            start_level: 15,
        }
    }

    fn catalog() -> Catalog {
        Catalog::new()
            .with_test("acme.StoreTest", "probe", |_| Ok(()))
            .with_test("acme.StoreTest", "fails", |_| {
                Err(TestFailure::assertion("expected 3, got 4"))
            })
            .with_test("acme.StoreTest", "panics", |_| panic!("index out of bounds"))
    }

    fn register(extender: &ProbeExtender, archive: &ArtifactArchive) -> Arc<ServiceRegistry> {
        let services = Arc::new(ServiceRegistry::new());
        let properties = BTreeMap::new();
        extender
            .bundle_started(&StartedBundle {
                info: &info(),
                archive,
                properties: &properties,
                services: &services,
            })
            .unwrap();
        services
    }

    async fn invoke(services: &ServiceRegistry, identifier: &str, method: &str, args: Vec<Value>) -> FrameworkResult<Value> {
        let found = services.find(&ServiceFilter::probe_invoker(identifier));
        assert_eq!(found.len(), 1);
        services.get(found[0].id).unwrap().invoke(method, args).await
    }

    fn probe_archive(methods: &[&str]) -> (Vec<String>, ArtifactArchive) {
        let mut builder = ProbeBuilder::new();
        let addresses = builder.add_tests("acme.StoreTest", methods).unwrap();
        let probe = builder.build().unwrap();
        let ids = addresses.iter().map(|a| a.identifier().to_string()).collect();
        (ids, ArtifactArchive::from_bytes(probe.bytes()).unwrap())
    }

    #[tokio::test]
    async fn test_registers_invoker_per_entry() {
        let (ids, archive) = probe_archive(&["probe", "fails"]);
        let services = register(&ProbeExtender::new(catalog()), &archive);
        assert_eq!(services.len(), 2);
        assert!(invoke(&services, &ids[0], METHOD_CALL, vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_failures_arrive_unwrapped() {
        let (ids, archive) = probe_archive(&["fails", "panics"]);
        let services = register(&ProbeExtender::new(catalog()), &archive);

        let err = invoke(&services, &ids[0], METHOD_CALL, vec![]).await.unwrap_err();
        assert_eq!(err, FrameworkError::Invocation(TestFailure::assertion("expected 3, got 4")));

        let err = invoke(&services, &ids[1], METHOD_CALL, vec![]).await.unwrap_err();
        match err {
            FrameworkError::Invocation(failure) => {
                assert_eq!(failure.kind, "panic");
                assert!(failure.message.contains("index out of bounds"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_probe_units_are_ignored() {
        let archive = ArchiveBuilder::named("acme.api", "1.0").build();
        let services = register(&ProbeExtender::new(catalog()), &archive);
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_rejected() {
        let (ids, archive) = probe_archive(&["probe"]);
        let services = register(&ProbeExtender::new(catalog()), &archive);
        let err = invoke(&services, &ids[0], "explode", vec![]).await.unwrap_err();
        assert!(matches!(err, FrameworkError::UnknownMethod { .. }));
    }

    #[tokio::test]
    async fn test_run_test_reports_to_invoker_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (ids, archive) = probe_archive(&["fails"]);
        let services = register(&ProbeExtender::new(catalog()).with_invoker_port(port), &archive);

        let description = TestDescription {
            identifier: ids[0].clone(),
            caption: "acme.StoreTest.fails".into(),
        };
        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut events = Vec::new();
            while let Some(event) = read_frame::<_, TestEvent>(&mut stream).await.unwrap() {
                events.push(event);
            }
            events
        });

        let result = invoke(
            &services,
            &ids[0],
            METHOD_RUN_TEST,
            vec![serde_json::to_value(&description).unwrap(), json!([])],
        )
        .await;
        assert_eq!(result.unwrap(), Value::Null);

        let events = tokio::time::timeout(Duration::from_secs(5), accept)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TestEvent::Started { .. }));
        assert!(matches!(&events[1], TestEvent::Failed { failure, .. } if failure.kind == "assertion"));
    }
}
