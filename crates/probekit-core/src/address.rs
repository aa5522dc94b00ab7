//! Test addresses and the instructions that locate test code.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExamError, ExamResult};

const IDENTIFIER_PREFIX: &str = "Probekit-";

/// Immutable identifier of one declared test point.
///
/// Equality, hashing and ordering use the identifier string only. An address
/// may decorate a parent address (e.g. a parameterised invocation of a
/// declared test); [`TestAddress::root`] walks back to the declared one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestAddress {
    identifier: String,
    caption: String,
    arguments: Vec<Value>,
    parent: Option<Box<TestAddress>>,
}

impl TestAddress {
    /// Create an address with a fresh, process-unique identifier.
    pub fn new(caption: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            identifier: format!("{IDENTIFIER_PREFIX}{}", uuid::Uuid::new_v4()),
            caption: caption.into(),
            arguments,
            parent: None,
        }
    }

    /// Derive an address chained onto `parent`.
    pub fn child_of(parent: &TestAddress, caption: impl Into<String>, arguments: Vec<Value>) -> Self {
        let mut address = Self::new(caption, arguments);
        address.parent = Some(Box::new(parent.clone()));
        address
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn caption(&self) -> &str {
        &self.caption
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    pub fn parent(&self) -> Option<&TestAddress> {
        self.parent.as_deref()
    }

    /// The top-level declared address.
    pub fn root(&self) -> &TestAddress {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }
}

impl PartialEq for TestAddress {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for TestAddress {}

impl Hash for TestAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl Ord for TestAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identifier.cmp(&other.identifier)
    }
}

impl PartialOrd for TestAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.caption, self.identifier)
    }
}

/// Serializable instruction for locating test code inside a runtime:
/// the owning identity plus the method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestInstantiationInstruction {
    owner: String,
    method: String,
}

impl TestInstantiationInstruction {
    pub fn new(owner: impl Into<String>, method: impl Into<String>) -> ExamResult<Self> {
        let owner = owner.into();
        let method = method.into();
        if owner.trim().is_empty() {
            return Err(ExamError::configuration("test owner identity must not be empty"));
        }
        if method.trim().is_empty() {
            return Err(ExamError::configuration(format!(
                "test method name for {owner} must not be empty"
            )));
        }
        Ok(Self { owner, method })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Lookup key used by the runtime catalog.
    pub fn key(&self) -> String {
        format!("{};{}", self.owner, self.method)
    }
}

impl fmt::Display for TestInstantiationInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.owner, self.method)
    }
}

/// What a listener is told about a running test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescription {
    pub identifier: String,
    pub caption: String,
}

impl From<&TestAddress> for TestDescription {
    fn from(address: &TestAddress) -> Self {
        Self {
            identifier: address.root().identifier().to_string(),
            caption: address.caption().to_string(),
        }
    }
}

impl fmt::Display for TestDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.caption)
    }
}
