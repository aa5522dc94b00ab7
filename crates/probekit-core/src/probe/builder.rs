use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use super::collector::{CollectFromBase, CollectFromItems, CompositeCollector, ContentCollector};
use super::manifest::{encode_table, ExecutableEntry};
use super::Probe;
use crate::address::{TestAddress, TestInstantiationInstruction};
use crate::archive::{content_digest, ArchiveBuilder};
use crate::constants::{
    HEADER_DYNAMIC_IMPORT, HEADER_EXECUTABLE, HEADER_IGNORE_PACKAGE, HEADER_IMPORT_PACKAGE,
    HEADER_SYMBOLIC_NAME,
};
use crate::error::{ExamError, ExamResult};

/// Method name used when a test is declared without one.
pub const DEFAULT_PROBE_METHOD: &str = "probe";

/// Package part of a dotted owner identity (`acme.store.StoreTest` ->
/// `acme.store`).
pub fn package_of(identity: &str) -> &str {
    identity.rsplit_once('.').map(|(package, _)| package).unwrap_or("")
}

/// Assembles a probe: declared tests, anchors and collected content.
#[derive(Debug, Default)]
pub struct ProbeBuilder {
    tests: Vec<(TestAddress, TestInstantiationInstruction)>,
    anchors: Vec<String>,
    headers: BTreeMap<String, String>,
    ignored_packages: BTreeSet<String>,
    resource_root: Option<PathBuf>,
    resources: Vec<(String, Vec<u8>)>,
}

impl ProbeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare one test; its owner also becomes an anchor.
    pub fn add_test(
        &mut self,
        owner: &str,
        method: &str,
        arguments: Vec<Value>,
    ) -> ExamResult<TestAddress> {
        let instruction = TestInstantiationInstruction::new(owner, method)?;
        let address = TestAddress::new(format!("{owner}.{method}"), arguments);
        self.add_anchor(owner);
        debug!(address = %address, instruction = %instruction, "declared probe test");
        self.tests.push((address.clone(), instruction));
        Ok(address)
    }

    /// Declare `owner`'s default `probe` method.
    pub fn add_default_test(&mut self, owner: &str) -> ExamResult<TestAddress> {
        self.add_test(owner, DEFAULT_PROBE_METHOD, Vec::new())
    }

    pub fn add_tests(&mut self, owner: &str, methods: &[&str]) -> ExamResult<Vec<TestAddress>> {
        methods
            .iter()
            .map(|method| self.add_test(owner, method, Vec::new()))
            .collect()
    }

    pub fn add_anchor(&mut self, identity: &str) -> &mut Self {
        if !self.anchors.iter().any(|a| a == identity) {
            self.anchors.push(identity.to_string());
        }
        self
    }

    /// Extra archive header. `build` rejects the executable table header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Exclude the package of `identity` from the implicit imports.
    pub fn ignore_package_of(&mut self, identity: &str) -> &mut Self {
        self.ignored_packages.insert(package_of(identity).to_string());
        self
    }

    /// Base folder scanned below each anchor's package directory.
    pub fn resource_root(&mut self, root: impl Into<PathBuf>) -> &mut Self {
        self.resource_root = Some(root.into());
        self
    }

    pub fn add_resource(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> &mut Self {
        self.resources.push((name.into(), data.into()));
        self
    }

    pub fn addresses(&self) -> Vec<TestAddress> {
        self.tests.iter().map(|(a, _)| a.clone()).collect()
    }

    fn anchor_packages(&self) -> BTreeSet<String> {
        self.anchors
            .iter()
            .map(|a| package_of(a).to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    pub fn build(&self) -> ExamResult<Probe> {
        if self.tests.is_empty() {
            return Err(ExamError::configuration("No tests added to probe"));
        }
        if self.headers.contains_key(HEADER_EXECUTABLE) {
            return Err(ExamError::configuration(format!(
                "header {HEADER_EXECUTABLE} is generated from the added tests and cannot be set"
            )));
        }

        let table: Vec<ExecutableEntry> = self
            .tests
            .iter()
            .map(|(address, instruction)| ExecutableEntry {
                identifier: address.identifier().to_string(),
                instruction: instruction.clone(),
            })
            .collect();

        let packages = self.anchor_packages();
        let imports: Vec<&str> = packages
            .iter()
            .filter(|p| !self.ignored_packages.contains(p.as_str()))
            .map(String::as_str)
            .collect();

        let mut archive = ArchiveBuilder::new()
            .header(HEADER_SYMBOLIC_NAME, "")
            .header(HEADER_DYNAMIC_IMPORT, "*")
            .header(HEADER_EXECUTABLE, encode_table(&table));
        if !imports.is_empty() {
            archive = archive.header(HEADER_IMPORT_PACKAGE, imports.join(","));
        }
        if !self.ignored_packages.is_empty() {
            let ignored: Vec<&str> = self.ignored_packages.iter().map(String::as_str).collect();
            archive = archive.header(HEADER_IGNORE_PACKAGE, ignored.join(","));
        }
        for (name, value) in &self.headers {
            archive = archive.header(name.clone(), value.clone());
        }

        let mut collector = CompositeCollector::new();
        if let Some(root) = &self.resource_root {
            collector = collector.with(CollectFromBase::new(root.clone(), packages.into_iter().collect()));
        }
        collector = collector.with(CollectFromItems::new(self.resources.clone()));
        let mut entries = BTreeMap::new();
        collector.collect(&mut entries)?;
        for (name, data) in entries {
            archive = archive.entry(name, data);
        }

        let bytes = archive.build().to_bytes()?;
        let digest = content_digest(&bytes);
        debug!(tests = self.tests.len(), digest = %digest, "built probe");
        Ok(Probe {
            addresses: self.addresses(),
            bytes,
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArtifactArchive;
    use crate::probe::manifest::decode_table;
    use serde_json::json;

    #[test]
    fn test_build_without_tests_fails() {
        let err = ProbeBuilder::new().build().unwrap_err();
        assert!(matches!(err, ExamError::Configuration(_)));
        assert!(err.to_string().contains("No tests added"));
    }

    #[test]
    fn test_anchor_alone_is_not_a_test() {
        let mut builder = ProbeBuilder::new();
        builder.add_anchor("acme.store.StoreTest");
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_table_recovers_declared_instructions() {
        let mut builder = ProbeBuilder::new();
        let a = builder.add_default_test("acme.store.StoreTest").unwrap();
        let b = builder
            .add_test("acme.store.StoreTest", "lookup", vec![json!(42)])
            .unwrap();
        let probe = builder.build().unwrap();

        let archive = ArtifactArchive::from_bytes(probe.bytes()).unwrap();
        let table = decode_table(archive.header(HEADER_EXECUTABLE).unwrap()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].identifier, a.identifier());
        assert_eq!(table[0].instruction.key(), "acme.store.StoreTest;probe");
        assert_eq!(table[1].identifier, b.identifier());
        assert_eq!(table[1].instruction.method(), "lookup");
        assert_eq!(probe.addresses(), &[a, b]);
    }

    #[test]
    fn test_headers_imports_and_ignored_packages() {
        let mut builder = ProbeBuilder::new();
        builder.add_tests("acme.store.StoreTest", &["put", "get"]).unwrap();
        builder.add_default_test("acme.cache.CacheTest").unwrap();
        builder.ignore_package_of("acme.cache.CacheTest");
        builder.set_header("X-Suite", "nightly");
        let probe = builder.build().unwrap();

        let archive = ArtifactArchive::from_bytes(probe.bytes()).unwrap();
        assert_eq!(archive.header(HEADER_SYMBOLIC_NAME), Some(""));
        assert_eq!(archive.header(HEADER_DYNAMIC_IMPORT), Some("*"));
        assert_eq!(archive.header(HEADER_IMPORT_PACKAGE), Some("acme.store"));
        assert_eq!(archive.header(HEADER_IGNORE_PACKAGE), Some("acme.cache"));
        assert_eq!(archive.header("X-Suite"), Some("nightly"));
    }

    #[test]
    fn test_executable_header_cannot_be_overridden() {
        let mut builder = ProbeBuilder::new();
        builder.add_default_test("acme.store.StoreTest").unwrap();
        builder.set_header(HEADER_EXECUTABLE, "forged=acme.Other;run");
        let err = builder.build().unwrap_err();
        assert!(matches!(err, ExamError::Configuration(_)), "got {err}");
        assert!(err.to_string().contains(HEADER_EXECUTABLE));
    }

    #[test]
    fn test_resources_collected_from_root_and_items() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("acme").join("store");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("fixture.json"), b"{\"k\":1}").unwrap();

        let mut builder = ProbeBuilder::new();
        builder.add_default_test("acme.store.StoreTest").unwrap();
        builder.resource_root(dir.path());
        builder.add_resource("extra/notes.txt", b"n".to_vec());
        let probe = builder.build().unwrap();

        let archive = ArtifactArchive::from_bytes(probe.bytes()).unwrap();
        assert_eq!(archive.entry("acme/store/fixture.json"), Some(&b"{\"k\":1}"[..]));
        assert_eq!(archive.entry("extra/notes.txt"), Some(&b"n"[..]));
    }

    #[test]
    fn test_probes_differ_by_content() {
        let mut first = ProbeBuilder::new();
        first.add_default_test("acme.StoreTest").unwrap();
        let mut second = ProbeBuilder::new();
        second.add_default_test("acme.StoreTest").unwrap();
        assert_ne!(first.build().unwrap().digest(), second.build().unwrap().digest());
    }

    #[test]
    fn test_package_of() {
        assert_eq!(package_of("acme.store.StoreTest"), "acme.store");
        assert_eq!(package_of("StoreTest"), "");
    }
}
