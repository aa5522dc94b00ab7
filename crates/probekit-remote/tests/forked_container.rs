//! Forked containers against the real `probekit-host` binary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use probekit_core::options::{environment, propagate_system_property, system_property, timeout};
use probekit_core::{
    ArchiveBuilder, CollectingListener, ContainerState, ExamError, ExamOption, ExamReactor,
    ExamSettings, ExamSystem, PerConfiguration, Player, ProbeBuilder, SharedContainer, TestContainer,
    TestEvent,
};
use probekit_remote::diagnostics::{
    ENVIRONMENT_TEST, FAILING_TEST, METHOD_FAILS, METHOD_PANICS, METHOD_PROPERTY_EQUALS,
    METHOD_VARIABLE_EQUALS, PROPERTY_TEST,
};
use probekit_remote::{ForkedTestContainer, ForkedTestContainerFactory};

const HOST: &str = env!("CARGO_BIN_EXE_probekit-host");

fn settings() -> ExamSettings {
    ExamSettings::default().with_timeout(Duration::from_secs(30))
}

fn container(options: Vec<ExamOption>) -> ForkedTestContainer {
    let system = ExamSystem::new(options, settings()).unwrap();
    ForkedTestContainer::new(Arc::new(system), HOST)
}

#[tokio::test]
async fn environment_overrides_and_propagates() {
    std::env::set_var("PROBEKIT_IT_OVERRIDE", "parent");
    std::env::set_var("PROBEKIT_IT_PROPAGATE", "inherited");
    std::env::set_var("PROBEKIT_IT_UNDECLARED", "parent-only");

    let report = Player::new(Arc::new(ForkedTestContainerFactory::new(HOST)))
        .with_settings(settings())
        .with([
            environment("PROBEKIT_IT_OVERRIDE=child"),
            environment("PROBEKIT_IT_PROPAGATE"),
        ])
        .test(
            ENVIRONMENT_TEST,
            METHOD_VARIABLE_EQUALS,
            vec![json!("PROBEKIT_IT_OVERRIDE"), json!("child")],
        )
        .test(
            ENVIRONMENT_TEST,
            METHOD_VARIABLE_EQUALS,
            vec![json!("PROBEKIT_IT_PROPAGATE"), json!("inherited")],
        )
        .test(
            ENVIRONMENT_TEST,
            METHOD_VARIABLE_EQUALS,
            vec![json!("PROBEKIT_IT_UNDECLARED"), Value::Null],
        )
        .play(&SharedContainer)
        .await
        .unwrap();

    for outcome in &report.outcomes {
        assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    }
    assert_eq!(report.passed(), 3);
}

#[tokio::test]
async fn host_without_environment_options_gets_no_parent_variables() {
    std::env::set_var("PROBEKIT_IT_PARENT_ONLY", "parent-only");

    let report = Player::new(Arc::new(ForkedTestContainerFactory::new(HOST)))
        .with_settings(settings())
        .test(
            ENVIRONMENT_TEST,
            METHOD_VARIABLE_EQUALS,
            vec![json!("PROBEKIT_IT_PARENT_ONLY"), Value::Null],
        )
        .play(&PerConfiguration)
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.failed());
}

#[tokio::test]
async fn unset_propagated_variable_fails_start() {
    let mut container = container(vec![environment("PROBEKIT_IT_NEVER_SET_ANYWHERE")]);
    let err = container.start().await.unwrap_err();
    assert!(matches!(err, ExamError::Configuration(_)), "got {err}");
    assert!(err.to_string().contains("PROBEKIT_IT_NEVER_SET_ANYWHERE"));
    assert_ne!(container.state(), ContainerState::Started);
}

#[tokio::test]
async fn properties_reach_the_forked_runtime() {
    std::env::set_var("probekit.it.propagated", "from-parent");
    let report = Player::new(Arc::new(ForkedTestContainerFactory::new(HOST)))
        .with_settings(settings())
        .with([
            system_property("acme.region", "eu"),
            propagate_system_property("probekit.it.propagated"),
        ])
        .test(PROPERTY_TEST, METHOD_PROPERTY_EQUALS, vec![json!("acme.region"), json!("eu")])
        .test(
            PROPERTY_TEST,
            METHOD_PROPERTY_EQUALS,
            vec![json!("probekit.it.propagated"), json!("from-parent")],
        )
        .play(&PerConfiguration)
        .await
        .unwrap();
    assert!(report.is_success(), "{:?}", report.failed());
}

#[tokio::test]
async fn failures_cross_the_process_boundary_unwrapped() {
    let mut builder = ProbeBuilder::new();
    let fails = builder
        .add_test(FAILING_TEST, METHOD_FAILS, vec![json!("ledger is empty")])
        .unwrap();
    let panics = builder.add_test(FAILING_TEST, METHOD_PANICS, vec![]).unwrap();
    let probe = builder.build().unwrap();

    let mut reactor = ExamReactor::new(Arc::new(ForkedTestContainerFactory::new(HOST)), settings());
    reactor.add_configuration(vec![timeout(Duration::from_secs(20))]).add_probe(probe);
    let staged = reactor.stage(&PerConfiguration).await.unwrap();

    let err = staged.invoke(&fails).await.unwrap_err();
    let failure = err.test_failure().expect("test failure");
    assert_eq!(failure.kind, "assertion");
    assert_eq!(failure.message, "ledger is empty");

    let listener = Arc::new(CollectingListener::new());
    staged.run_test(&panics, listener.clone()).await.unwrap();
    let events = listener.events();
    assert!(matches!(events.first(), Some(TestEvent::Started { .. })));
    let failure = listener.failure().expect("failed event");
    assert_eq!(failure.kind, "panic");
    assert!(failure.message.contains("panicking on purpose"));

    staged.tear_down().await;
}

#[tokio::test]
async fn provisioned_files_are_installed_and_host_exits_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("acme-api.pkar");
    ArchiveBuilder::named("acme.api", "1.2.0")
        .header("Export-Package", "acme.api")
        .write_to(&path)
        .unwrap();

    let mut container = container(vec![probekit_core::options::provision(format!(
        "file:{}",
        path.display()
    ))
    .into()]);
    container.stop().await.unwrap();

    container.start().await.unwrap();
    assert_eq!(container.state(), ContainerState::Started);
    assert!(container.host_pid().is_some());
    assert!(container.start().await.is_err());

    container.stop().await.unwrap();
    assert_eq!(container.state(), ContainerState::Stopped);
    assert!(container.host_pid().is_none());
}
