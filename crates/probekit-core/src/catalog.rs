//! Registry of runnable code linked into the process that hosts a runtime.
//!
//! Test instructions (`owner;method`) and activator names shipped inside
//! artifacts are resolved against this table when a unit is started or a
//! test is invoked.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::address::TestInstantiationInstruction;
use crate::error::TestFailure;
use crate::probe::package_of;

/// What a test function sees when it runs.
#[derive(Debug, Clone, Default)]
pub struct TestContext {
    pub arguments: Vec<Value>,
    pub properties: BTreeMap<String, String>,
}

impl TestContext {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// What an activator sees when its unit starts.
#[derive(Debug, Clone, Default)]
pub struct ActivatorContext {
    pub symbolic_name: String,
    pub properties: BTreeMap<String, String>,
}

impl ActivatorContext {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

pub type TestFn = Arc<dyn Fn(&TestContext) -> Result<(), TestFailure> + Send + Sync>;
pub type ActivatorFn = Arc<dyn Fn(&ActivatorContext) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Catalog {
    tests: BTreeMap<String, TestFn>,
    activators: BTreeMap<String, ActivatorFn>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_test<F>(mut self, owner: &str, method: &str, f: F) -> Self
    where
        F: Fn(&TestContext) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.register_test(owner, method, f);
        self
    }

    pub fn register_test<F>(&mut self, owner: &str, method: &str, f: F)
    where
        F: Fn(&TestContext) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.tests.insert(format!("{owner};{method}"), Arc::new(f));
    }

    pub fn with_activator<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&ActivatorContext) -> Result<(), String> + Send + Sync + 'static,
    {
        self.activators.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn test(&self, instruction: &TestInstantiationInstruction) -> Option<TestFn> {
        self.tests.get(&instruction.key()).cloned()
    }

    pub fn activator(&self, name: &str) -> Option<ActivatorFn> {
        self.activators.get(name).cloned()
    }

    /// Packages of every registered test owner. The owner is the part of
    /// each `owner;method` key before its first `;`.
    pub fn exported_packages(&self) -> BTreeSet<String> {
        self.tests
            .keys()
            .filter_map(|key| key.split_once(';'))
            .map(|(owner, _)| package_of(owner).to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Merge `other` into this catalog; `other` wins on key clashes.
    pub fn merge(mut self, other: Catalog) -> Self {
        self.tests.extend(other.tests);
        self.activators.extend(other.activators);
        self
    }
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("tests", &self.tests.keys().collect::<Vec<_>>())
            .field("activators", &self.activators.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_instruction() {
        let catalog = Catalog::new().with_test("acme.store.StoreTest", "probe", |_| Ok(()));
        let hit = TestInstantiationInstruction::new("acme.store.StoreTest", "probe").unwrap();
        let miss = TestInstantiationInstruction::new("acme.store.StoreTest", "other").unwrap();
        assert!(catalog.test(&hit).is_some());
        assert!(catalog.test(&miss).is_none());
    }

    #[test]
    fn test_exported_packages_from_owners() {
        let catalog = Catalog::new()
            .with_test("acme.store.StoreTest", "probe", |_| Ok(()))
            .with_test("acme.cache.CacheTest", "probe", |_| Ok(()))
            .with_test("RootTest", "probe", |_| Ok(()));
        let packages: Vec<String> = catalog.exported_packages().into_iter().collect();
        assert_eq!(packages, vec!["acme.cache", "acme.store"]);
    }

    #[test]
    fn test_test_fn_sees_arguments() {
        let catalog = Catalog::new().with_test("acme.T", "sum", |ctx| {
            let total: i64 = ctx.arguments.iter().filter_map(Value::as_i64).sum();
            if total == 3 {
                Ok(())
            } else {
                Err(TestFailure::assertion(format!("expected 3, got {total}")))
            }
        });
        let f = catalog
            .test(&TestInstantiationInstruction::new("acme.T", "sum").unwrap())
            .unwrap();
        let ctx = TestContext {
            arguments: vec![serde_json::json!(1), serde_json::json!(2)],
            ..Default::default()
        };
        assert!(f(&ctx).is_ok());
        assert!(f(&TestContext::default()).is_err());
    }
}
