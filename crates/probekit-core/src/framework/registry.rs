//! Service registry with bounded waits for late registrations.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{BundleId, Service, ServiceId, ServiceReference};
use crate::filter::ServiceFilter;

pub const SERVICE_ID_KEY: &str = "service.id";

struct Registration {
    reference: ServiceReference,
    service: Arc<dyn Service>,
}

#[derive(Default)]
struct Inner {
    next_id: ServiceId,
    services: BTreeMap<ServiceId, Registration>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(
        &self,
        owner: BundleId,
        mut properties: BTreeMap<String, String>,
        service: Arc<dyn Service>,
    ) -> ServiceReference {
        let reference = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            properties.insert(SERVICE_ID_KEY.to_string(), id.to_string());
            let reference = ServiceReference {
                id,
                bundle: owner,
                properties,
            };
            inner.services.insert(
                id,
                Registration {
                    reference: reference.clone(),
                    service,
                },
            );
            reference
        };
        debug!(service_id = reference.id, bundle = owner, "registered service");
        self.changed.notify_waiters();
        reference
    }

    /// Drop every service registered by `owner`; returns how many.
    pub fn unregister_owner(&self, owner: BundleId) -> usize {
        let removed = {
            let mut inner = self.lock();
            let before = inner.services.len();
            inner.services.retain(|_, r| r.reference.bundle != owner);
            before - inner.services.len()
        };
        if removed > 0 {
            debug!(bundle = owner, removed, "unregistered services");
            self.changed.notify_waiters();
        }
        removed
    }

    pub fn find(&self, filter: &ServiceFilter) -> Vec<ServiceReference> {
        self.lock()
            .services
            .values()
            .filter(|r| filter.matches(&r.reference.properties))
            .map(|r| r.reference.clone())
            .collect()
    }

    pub fn get(&self, id: ServiceId) -> Option<Arc<dyn Service>> {
        self.lock().services.get(&id).map(|r| Arc::clone(&r.service))
    }

    /// Matching services, waiting up to `timeout` for at least one.
    pub async fn wait_for(&self, filter: &ServiceFilter, timeout: Duration) -> Vec<ServiceReference> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            let found = self.find(filter);
            if !found.is_empty() {
                return found;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.find(filter);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::FrameworkResult;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        async fn invoke(&self, _method: &str, args: Vec<Value>) -> FrameworkResult<Value> {
            Ok(Value::Array(args))
        }
    }

    fn tagged(tag: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("tag".to_string(), tag.to_string())])
    }

    #[tokio::test]
    async fn test_register_find_and_unregister_owner() {
        let registry = ServiceRegistry::new();
        registry.register(1, tagged("a"), Arc::new(Echo));
        registry.register(2, tagged("b"), Arc::new(Echo));

        let found = registry.find(&ServiceFilter::equals("tag", "a"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bundle, 1);
        assert!(found[0].properties.contains_key(SERVICE_ID_KEY));

        assert_eq!(registry.unregister_owner(1), 1);
        assert!(registry.find(&ServiceFilter::equals("tag", "a")).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_sees_late_registration() {
        let registry = Arc::new(ServiceRegistry::new());
        let late = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            late.register(3, tagged("late"), Arc::new(Echo));
        });

        let found = registry
            .wait_for(&ServiceFilter::equals("tag", "late"), Duration::from_secs(5))
            .await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_gives_up_after_timeout() {
        let registry = ServiceRegistry::new();
        let found = registry
            .wait_for(&ServiceFilter::equals("tag", "never"), Duration::from_millis(30))
            .await;
        assert!(found.is_empty());
    }
}
