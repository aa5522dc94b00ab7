//! Artifact identity: symbolic name plus structured version.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExamError, ExamResult};

/// Dotted `major.minor.micro.qualifier` version with a total order.
///
/// Missing numeric parts default to zero; the qualifier compares as a plain
/// string, and an empty qualifier sorts first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
    pub qualifier: String,
}

impl Version {
    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: String::new(),
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    /// `1.2.3-SNAPSHOT` style versions without the snapshot marker.
    pub fn without_snapshot(version: &str) -> &str {
        version.split('-').next().unwrap_or(version)
    }
}

impl FromStr for Version {
    type Err = ExamError;

    fn from_str(s: &str) -> ExamResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Version::default());
        }
        let mut parts = s.splitn(4, '.');
        let mut numeric = [0u32; 3];
        for slot in numeric.iter_mut() {
            match parts.next() {
                Some(part) => {
                    *slot = part.parse().map_err(|_| {
                        ExamError::configuration(format!("invalid version '{s}': '{part}' is not a number"))
                    })?;
                }
                None => break,
            }
        }
        let qualifier = parts.next().unwrap_or_default().to_string();
        if !qualifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ExamError::configuration(format!(
                "invalid version '{s}': bad qualifier '{qualifier}'"
            )));
        }
        Ok(Version {
            major: numeric[0],
            minor: numeric[1],
            micro: numeric[2],
            qualifier,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.micro)
            .cmp(&(other.major, other.minor, other.micro))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

/// Identity of an installable unit, carrying an opaque context payload.
///
/// Equality and ordering look at identity then version only; the context
/// never participates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo<C = ()> {
    symbolic_name: String,
    version: Version,
    context: C,
}

impl<C> ArtifactInfo<C> {
    pub fn new(symbolic_name: impl Into<String>, version: Version, context: C) -> ExamResult<Self> {
        let symbolic_name = symbolic_name.into();
        if symbolic_name.trim().is_empty() {
            return Err(ExamError::configuration("artifact symbolic name must not be empty"));
        }
        Ok(Self {
            symbolic_name,
            version,
            context,
        })
    }

    /// Read identity from manifest-style headers (`Bundle-SymbolicName`,
    /// `Bundle-Version`); directives after `;` are ignored.
    pub fn from_headers(
        headers: &std::collections::BTreeMap<String, String>,
        context: C,
    ) -> ExamResult<Self> {
        let name = required_header(headers, crate::constants::HEADER_SYMBOLIC_NAME)?;
        let version = headers
            .get(crate::constants::HEADER_VERSION)
            .map(|v| first_clause(v).parse())
            .transpose()?
            .unwrap_or_default();
        Self::new(first_clause(name), version, context)
    }

    pub fn id(&self) -> &str {
        &self.symbolic_name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn map_context<D>(self, f: impl FnOnce(C) -> D) -> ArtifactInfo<D> {
        ArtifactInfo {
            symbolic_name: self.symbolic_name,
            version: self.version,
            context: f(self.context),
        }
    }
}

fn required_header<'a>(
    headers: &'a std::collections::BTreeMap<String, String>,
    name: &str,
) -> ExamResult<&'a str> {
    headers
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ExamError::configuration(format!("header {name} not found in manifest")))
}

fn first_clause(value: &str) -> &str {
    value.split(';').next().unwrap_or(value).trim()
}

impl<C> PartialEq for ArtifactInfo<C> {
    fn eq(&self, other: &Self) -> bool {
        self.symbolic_name == other.symbolic_name && self.version == other.version
    }
}

impl<C> Eq for ArtifactInfo<C> {}

impl<C> Ord for ArtifactInfo<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.symbolic_name
            .cmp(&other.symbolic_name)
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl<C> PartialOrd for ArtifactInfo<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> std::hash::Hash for ArtifactInfo<C> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.symbolic_name.hash(state);
        self.version.hash(state);
    }
}

impl<C> fmt::Display for ArtifactInfo<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbolic_name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_version_parse_defaults_missing_parts() {
        let v: Version = "2.1".parse().unwrap();
        assert_eq!(v, Version::new(2, 1, 0));
        assert_eq!(v.to_string(), "2.1.0");
    }

    #[test]
    fn test_version_qualifier_ordering() {
        let plain: Version = "1.0.0".parse().unwrap();
        let rc: Version = "1.0.0.RC1".parse().unwrap();
        let next: Version = "1.0.1".parse().unwrap();
        assert!(plain < rc);
        assert!(rc < next);
    }

    #[test]
    fn test_version_rejects_garbage() {
        assert!("1.x.0".parse::<Version>().is_err());
        assert!("1.0.0.bad qualifier".parse::<Version>().is_err());
    }

    #[test]
    fn test_artifact_equality_ignores_context() {
        let a = ArtifactInfo::new("org.acme.store", Version::new(1, 0, 0), 7u64).unwrap();
        let b = ArtifactInfo::new("org.acme.store", Version::new(1, 0, 0), 9u64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_artifact_ordering_is_identity_then_version() {
        let mut artifacts = vec![
            ArtifactInfo::new("b.bundle", Version::new(1, 0, 0), ()).unwrap(),
            ArtifactInfo::new("a.bundle", Version::new(2, 0, 0), ()).unwrap(),
            ArtifactInfo::new("a.bundle", Version::new(1, 5, 0), ()).unwrap(),
        ];
        artifacts.sort();
        let rendered: Vec<String> = artifacts.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["a.bundle:1.5.0", "a.bundle:2.0.0", "b.bundle:1.0.0"]);
    }

    #[test]
    fn test_artifact_requires_symbolic_name() {
        assert!(ArtifactInfo::new("  ", Version::default(), ()).is_err());
    }

    #[test]
    fn test_artifact_from_headers_strips_directives() {
        let mut headers = BTreeMap::new();
        headers.insert(
            "Bundle-SymbolicName".to_string(),
            "org.acme.api;singleton:=true".to_string(),
        );
        headers.insert("Bundle-Version".to_string(), "3.2.1".to_string());
        let info = ArtifactInfo::from_headers(&headers, ()).unwrap();
        assert_eq!(info.id(), "org.acme.api");
        assert_eq!(info.version(), &Version::new(3, 2, 1));
    }

    #[test]
    fn test_artifact_from_headers_missing_name() {
        let headers = BTreeMap::new();
        let err = ArtifactInfo::from_headers(&headers, ()).unwrap_err();
        assert!(err.to_string().contains("Bundle-SymbolicName"));
    }
}
