//! Installable unit image: manifest headers plus named byte entries.
//!
//! Encoded as a fixed magic prefix followed by a JSON document in which entry
//! contents are hex strings.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{HEADER_SYMBOLIC_NAME, HEADER_VERSION};
use crate::error::{ExamError, ExamResult};

const MAGIC: &[u8] = b"PKAR1\n";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactArchive {
    headers: BTreeMap<String, String>,
    entries: BTreeMap<String, Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct EncodedArchive {
    headers: BTreeMap<String, String>,
    entries: BTreeMap<String, String>,
}

impl ArtifactArchive {
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn to_bytes(&self) -> ExamResult<Vec<u8>> {
        let encoded = EncodedArchive {
            headers: self.headers.clone(),
            entries: self
                .entries
                .iter()
                .map(|(name, data)| (name.clone(), hex::encode(data)))
                .collect(),
        };
        let mut bytes = MAGIC.to_vec();
        serde_json::to_writer(&mut bytes, &encoded)?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> ExamResult<Self> {
        let body = bytes
            .strip_prefix(MAGIC)
            .ok_or_else(|| ExamError::configuration("not an artifact archive: bad magic prefix"))?;
        let encoded: EncodedArchive = serde_json::from_slice(body)?;
        let mut entries = BTreeMap::new();
        for (name, data) in encoded.entries {
            let data = hex::decode(&data).map_err(|e| {
                ExamError::configuration(format!("archive entry {name} is not valid hex: {e}"))
            })?;
            entries.insert(name, data);
        }
        Ok(Self {
            headers: encoded.headers,
            entries,
        })
    }

    pub fn read_from(path: &Path) -> ExamResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// SHA-256 over the encoded image, hex encoded.
    pub fn digest(&self) -> ExamResult<String> {
        Ok(content_digest(&self.to_bytes()?))
    }
}

pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Builder for arbitrary installable units.
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    archive: ArtifactArchive,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `Bundle-SymbolicName` and `Bundle-Version` set.
    pub fn named(symbolic_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new()
            .header(HEADER_SYMBOLIC_NAME, symbolic_name)
            .header(HEADER_VERSION, version)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.archive.headers.insert(name.into(), value.into());
        self
    }

    pub fn entry(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.archive.entries.insert(name.into(), data.into());
        self
    }

    pub fn build(self) -> ArtifactArchive {
        self.archive
    }

    pub fn write_to(self, path: &Path) -> ExamResult<()> {
        std::fs::write(path, self.archive.to_bytes()?)?;
        Ok(())
    }
}
