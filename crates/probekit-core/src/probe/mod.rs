//! Probe artifacts: the installable unit carrying the test address table.

pub mod builder;
pub mod collector;
pub mod manifest;

pub use builder::{package_of, ProbeBuilder, DEFAULT_PROBE_METHOD};
pub use collector::{CollectFromBase, CollectFromItems, CompositeCollector, ContentCollector};
pub use manifest::{decode_table, encode_table, ExecutableEntry};

use crate::address::TestAddress;

/// A built probe: its encoded archive plus the addresses it serves.
#[derive(Debug, Clone)]
pub struct Probe {
    pub(crate) addresses: Vec<TestAddress>,
    pub(crate) bytes: Vec<u8>,
    pub(crate) digest: String,
}

impl Probe {
    pub fn addresses(&self) -> &[TestAddress] {
        &self.addresses
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// SHA-256 of the archive; probes are told apart by content.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Install location reported to the runtime.
    pub fn location(&self) -> String {
        format!("local:probe:{}", &self.digest[..12.min(self.digest.len())])
    }

    pub fn contains(&self, address: &TestAddress) -> bool {
        let root = address.root();
        self.addresses.iter().any(|a| a == root)
    }
}
