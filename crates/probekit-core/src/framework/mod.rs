//! Runtime control surface.
//!
//! A [`Framework`] is one modular runtime instance: it installs units,
//! resolves them, moves through start levels and hosts services. The native
//! container drives any implementation through this trait; the in-memory
//! runtime in [`memory`] is the reference implementation.

pub mod extender;
pub mod memory;
pub mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{ExamError, TestFailure};
use crate::filter::ServiceFilter;

pub use extender::{ProbeExtender, ProbeInvoker};
pub use memory::{MemoryFramework, MemoryFrameworkFactory};
pub use registry::ServiceRegistry;

pub type BundleId = u64;
pub type ServiceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameworkState {
    Created,
    Initialized,
    Active,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameworkEvent {
    Started,
    StartLevelChanged { level: u32 },
    Error { bundle: BundleId, message: String },
    Stopped,
    WaitTimedOut,
}

/// Snapshot of one installed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub id: BundleId,
    pub location: String,
    /// Empty for anonymous units such as probes.
    pub symbolic_name: String,
    pub version: String,
    pub state: BundleState,
    pub start_level: u32,
}

impl std::fmt::Display for BundleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.symbolic_name.is_empty() {
            write!(f, "#{} ({})", self.id, self.location)
        } else {
            write!(f, "#{} {}:{}", self.id, self.symbolic_name, self.version)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReference {
    pub id: ServiceId,
    pub bundle: BundleId,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum FrameworkError {
    #[error("framework is {state:?}, expected {expected}")]
    InvalidState { state: FrameworkState, expected: String },

    #[error("no bundle with id {id}")]
    UnknownBundle { id: BundleId },

    #[error("cannot install {location}: {reason}")]
    Install { location: String, reason: String },

    #[error("bundle {bundle} cannot be resolved: missing {}", .missing.join(", "))]
    Resolve { bundle: String, missing: Vec<String> },

    #[error("activator of bundle {bundle} failed: {message}")]
    Activator { bundle: String, message: String },

    #[error("no service matching {filter} within {timeout_ms} ms")]
    ServiceNotFound { filter: String, timeout_ms: u64 },

    #[error("no service with id {id}")]
    UnknownService { id: ServiceId },

    #[error("service has no method '{method}'")]
    UnknownMethod { method: String },

    #[error("invalid arguments for '{method}': {reason}")]
    InvalidArguments { method: String, reason: String },

    /// The invoked test code failed; carried as raised.
    #[error(transparent)]
    Invocation(TestFailure),

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("io failure: {message}")]
    Io { message: String },
}

impl From<std::io::Error> for FrameworkError {
    fn from(e: std::io::Error) -> Self {
        FrameworkError::Io {
            message: e.to_string(),
        }
    }
}

impl From<FrameworkError> for ExamError {
    fn from(e: FrameworkError) -> Self {
        match e {
            FrameworkError::Invocation(failure) => ExamError::Invocation(failure),
            other => ExamError::container_caused_by(other.to_string(), other),
        }
    }
}

pub type FrameworkResult<T> = std::result::Result<T, FrameworkError>;

/// A callable object registered in a runtime's service registry.
#[async_trait]
pub trait Service: Send + Sync {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> FrameworkResult<Value>;
}

#[async_trait]
pub trait Framework: Send + Sync {
    async fn init(&self) -> FrameworkResult<()>;

    async fn start(&self) -> FrameworkResult<()>;

    /// Request shutdown; completion is observed with [`Framework::wait_for_stop`].
    async fn stop(&self) -> FrameworkResult<()>;

    /// `Stopped`, or `WaitTimedOut` if shutdown did not finish in time.
    async fn wait_for_stop(&self, timeout: Duration) -> FrameworkResult<FrameworkEvent>;

    async fn state(&self) -> FrameworkResult<FrameworkState>;

    /// Install from `content` when given, otherwise by dereferencing
    /// `location`. Installing an existing location returns its id.
    async fn install_bundle(&self, location: &str, content: Option<Vec<u8>>) -> FrameworkResult<BundleId>;

    async fn update_bundle(&self, id: BundleId, content: Option<Vec<u8>>) -> FrameworkResult<()>;

    async fn start_bundle(&self, id: BundleId) -> FrameworkResult<()>;

    async fn uninstall_bundle(&self, id: BundleId) -> FrameworkResult<()>;

    async fn bundle_state(&self, id: BundleId) -> FrameworkResult<BundleState>;

    async fn bundle_info(&self, id: BundleId) -> FrameworkResult<BundleInfo>;

    async fn bundles(&self) -> FrameworkResult<Vec<BundleInfo>>;

    async fn set_bundle_start_level(&self, id: BundleId, level: u32) -> FrameworkResult<()>;

    /// Begin moving to `level`; progress is reported as
    /// [`FrameworkEvent::StartLevelChanged`].
    async fn set_start_level(&self, level: u32) -> FrameworkResult<()>;

    async fn start_level(&self) -> FrameworkResult<u32>;

    /// Move to `level` and wait until it is confirmed; `false` if `timeout`
    /// elapsed first.
    async fn set_start_level_and_wait(&self, level: u32, timeout: Duration) -> FrameworkResult<bool> {
        wait_for_start_level(self, level, timeout).await
    }

    fn subscribe(&self) -> broadcast::Receiver<FrameworkEvent>;

    /// Services matching `filter`, waiting up to `timeout` for one to appear.
    async fn find_services(
        &self,
        filter: &ServiceFilter,
        timeout: Duration,
    ) -> FrameworkResult<Vec<ServiceReference>>;

    async fn invoke_service(
        &self,
        reference: &ServiceReference,
        method: &str,
        args: Vec<Value>,
    ) -> FrameworkResult<Value>;
}

/// Builds runtimes from a computed property set.
pub trait FrameworkFactory: Send + Sync {
    fn new_framework(&self, properties: BTreeMap<String, String>) -> FrameworkResult<Arc<dyn Framework>>;
}

/// Event-driven start level wait used by runtimes that publish
/// [`FrameworkEvent::StartLevelChanged`].
///
/// The subscription is taken before the level is requested so no change
/// event is missed.
pub async fn wait_for_start_level<F: Framework + ?Sized>(
    framework: &F,
    level: u32,
    timeout: Duration,
) -> FrameworkResult<bool> {
    let mut events = framework.subscribe();
    framework.set_start_level(level).await?;
    if framework.start_level().await? == level {
        return Ok(true);
    }

    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => break,
            Ok(Ok(FrameworkEvent::StartLevelChanged { level: reached })) if reached == level => {
                return Ok(true)
            }
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                if framework.start_level().await? == level {
                    return Ok(true);
                }
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
        }
    }
    Ok(framework.start_level().await? == level)
}

/// Split a manifest package list, keeping the first clause of each entry.
///
/// Entries are separated by commas and the package name ends at the first
/// `;` outside double quotes, so `acme.api;version="[1,2)"` is one entry
/// named `acme.api`. Backslash escapes are not recognised.
pub(crate) fn package_list(header: Option<&str>) -> Vec<String> {
    let mut packages = Vec::new();
    let mut current = String::new();
    let mut in_name = true;
    let mut quoted = false;
    for c in header.unwrap_or_default().chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                push_package(&mut packages, &current);
                current.clear();
                in_name = true;
            }
            ';' if !quoted => in_name = false,
            _ if in_name => current.push(c),
            _ => {}
        }
    }
    push_package(&mut packages, &current);
    packages
}

fn push_package(packages: &mut Vec<String>, name: &str) {
    let name = name.trim();
    if !name.is_empty() {
        packages.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_list_strips_directives() {
        assert_eq!(
            package_list(Some("acme.api;version=1.0, acme.spi ,")),
            vec!["acme.api", "acme.spi"]
        );
        assert!(package_list(None).is_empty());
    }

    #[test]
    fn test_package_list_ignores_separators_in_quoted_attributes() {
        assert_eq!(
            package_list(Some(r#"acme.api;version="[1.0,2.0)";uses:="acme.spi,acme.util", acme.spi"#)),
            vec!["acme.api", "acme.spi"]
        );
    }

    #[test]
    fn test_invocation_converts_unwrapped() {
        let err: ExamError = FrameworkError::Invocation(TestFailure::panic("oops")).into();
        assert_eq!(err.test_failure().unwrap().kind, "panic");

        let err: ExamError = FrameworkError::UnknownBundle { id: 9 }.into();
        assert!(matches!(err, ExamError::Container { .. }));
        assert!(err.to_string().contains("no bundle with id 9"));
    }

    #[test]
    fn test_framework_error_crosses_json() {
        let err = FrameworkError::Resolve {
            bundle: "acme.impl".into(),
            missing: vec!["acme.api".into()],
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: FrameworkError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);

        let failure = FrameworkError::Invocation(TestFailure::assertion("expected 3"));
        let json = serde_json::to_string(&failure).unwrap();
        let back: FrameworkError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failure);
    }
}
