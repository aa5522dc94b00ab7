//! Structured observability hooks for container lifecycle events.
//!
//! This module provides:
//! - Container-scoped tracing spans via [`container_span`], attached to
//!   lifecycle futures with `tracing::Instrument`
//! - Emission functions for lifecycle milestones: start, probe install,
//!   invocation, stop and teardown failures
//!
//! Events are emitted at `info!` level unless noted; set `RUST_LOG` to
//! filter them.

use tracing::{error, info, warn};

/// Span tagging every event of one container.
///
/// # Example
///
/// ```ignore
/// use tracing::Instrument;
/// container.start_inner().instrument(container_span("native-3f2a9c1d")).await
/// // every tracing call now carries container = "native-3f2a9c1d"
/// ```
pub fn container_span(container: &str) -> tracing::Span {
    tracing::info_span!("probekit.container", container = %container)
}

/// Emit event: container started and reached its target start level.
pub fn emit_container_started(container: &str, start_level: u32, bundles: usize, duration_ms: u64) {
    info!(
        event = "container.started",
        container = %container,
        start_level = start_level,
        bundles = bundles,
        duration_ms = duration_ms,
    );
}

/// Emit event: probe installed and started.
pub fn emit_probe_installed(container: &str, bundle: u64, tests: usize) {
    info!(
        event = "probe.installed",
        container = %container,
        bundle = bundle,
        tests = tests,
    );
}

/// Emit event: a test address was invoked.
pub fn emit_test_invoked(container: &str, identifier: &str, success: bool, duration_ms: u64) {
    info!(
        event = "test.invoked",
        container = %container,
        identifier = %identifier,
        success = success,
        duration_ms = duration_ms,
    );
}

/// Emit event: container stopped.
pub fn emit_container_stopped(container: &str, duration_ms: u64) {
    info!(event = "container.stopped", container = %container, duration_ms = duration_ms);
}

/// Emit event: a unit did not resolve (error level).
pub fn emit_bundle_unresolved(container: &str, bundle: &dyn std::fmt::Display) {
    error!(event = "bundle.unresolved", container = %container, bundle = %bundle);
}

/// Emit event: a best-effort cleanup step failed (warning level).
pub fn emit_cleanup_failure(container: &str, step: &str, error: &dyn std::fmt::Display) {
    warn!(event = "container.cleanup_failed", container = %container, step = %step, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_span_create() {
        let _span = container_span("native-test").entered();
        emit_container_started("native-test", 15, 3, 12);
        emit_cleanup_failure("native-test", "uninstall", &"already gone");
    }
}
