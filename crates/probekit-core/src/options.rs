//! Declarative option model consumed by exam systems and containers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExamError, ExamResult};

/// What to install into a runtime and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionOption {
    /// Dereferenceable locator (`file:`, `reference:file:`, or a locator
    /// produced by an external resolver).
    pub url: String,
    /// Positive start level; `None` means the default provision level.
    pub start_level: Option<u32>,
    pub start: bool,
    pub update: bool,
}

impl ProvisionOption {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            start_level: None,
            start: true,
            update: false,
        }
    }

    pub fn start_level(mut self, level: u32) -> Self {
        self.start_level = Some(level);
        self
    }

    pub fn no_start(mut self) -> Self {
        self.start = false;
        self
    }

    pub fn update(mut self) -> Self {
        self.update = true;
        self
    }

    /// Start level to assign, falling back to `default`.
    pub fn effective_start_level(&self, default: u32) -> u32 {
        self.start_level.unwrap_or(default)
    }

    fn validate(&self) -> ExamResult<()> {
        if self.url.trim().is_empty() {
            return Err(ExamError::configuration("provision URL must not be empty"));
        }
        if self.start_level == Some(0) {
            return Err(ExamError::configuration(format!(
                "start level of {} must be a positive integer",
                self.url
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ProvisionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Artifact repository made available to the provisioning collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryOption {
    pub url: String,
    pub allow_snapshots: bool,
    pub allow_releases: bool,
}

impl RepositoryOption {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            allow_snapshots: false,
            allow_releases: true,
        }
    }

    pub fn allow_snapshots(mut self) -> Self {
        self.allow_snapshots = true;
        self
    }

    pub fn disable_releases(mut self) -> Self {
        self.allow_releases = false;
        self
    }

    /// Repository location with policy markers, e.g. `https://repo@snapshots`.
    pub fn repository(&self) -> ExamResult<String> {
        if !self.allow_releases && !self.allow_snapshots {
            return Err(ExamError::configuration(format!(
                "repository {} disallows both releases and snapshots",
                self.url
            )));
        }
        let mut location = self.url.clone();
        if self.allow_snapshots {
            location.push_str("@snapshots");
        }
        if !self.allow_releases {
            location.push_str("@noreleases");
        }
        Ok(location)
    }
}

/// Kind of an option, used for "all options of kind K" queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    Provision,
    SystemPackage,
    BootDelegation,
    FrameworkProperty,
    SystemProperty,
    PropagateSystemProperty,
    FrameworkStartLevel,
    Timeout,
    CleanCaches,
    Repository,
    HostArgument,
    Environment,
    FailOnUnresolved,
}

impl OptionKind {
    /// Whether more than one option of this kind may be declared.
    pub fn allows_multiple(&self) -> bool {
        !matches!(
            self,
            OptionKind::FrameworkStartLevel
                | OptionKind::Timeout
                | OptionKind::CleanCaches
                | OptionKind::FailOnUnresolved
        )
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptionKind::Provision => "provision",
            OptionKind::SystemPackage => "system_package",
            OptionKind::BootDelegation => "boot_delegation",
            OptionKind::FrameworkProperty => "framework_property",
            OptionKind::SystemProperty => "system_property",
            OptionKind::PropagateSystemProperty => "propagate_system_property",
            OptionKind::FrameworkStartLevel => "framework_start_level",
            OptionKind::Timeout => "timeout",
            OptionKind::CleanCaches => "clean_caches",
            OptionKind::Repository => "repository",
            OptionKind::HostArgument => "host_argument",
            OptionKind::Environment => "environment",
            OptionKind::FailOnUnresolved => "fail_on_unresolved",
        };
        f.write_str(name)
    }
}

/// One declared option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExamOption {
    Provision(ProvisionOption),
    SystemPackage { package: String },
    BootDelegation { package: String },
    FrameworkProperty { key: String, value: String },
    SystemProperty { key: String, value: String },
    PropagateSystemProperty { key: String },
    FrameworkStartLevel { level: u32 },
    Timeout { millis: u64 },
    CleanCaches { clean: bool },
    Repository(RepositoryOption),
    /// Extra command-line argument for a forked runtime host.
    HostArgument { argument: String },
    /// `NAME` propagates the parent's value, `NAME=value` overrides it.
    Environment { entry: String },
    FailOnUnresolved { fail: bool },
}

impl ExamOption {
    pub fn kind(&self) -> OptionKind {
        match self {
            ExamOption::Provision(_) => OptionKind::Provision,
            ExamOption::SystemPackage { .. } => OptionKind::SystemPackage,
            ExamOption::BootDelegation { .. } => OptionKind::BootDelegation,
            ExamOption::FrameworkProperty { .. } => OptionKind::FrameworkProperty,
            ExamOption::SystemProperty { .. } => OptionKind::SystemProperty,
            ExamOption::PropagateSystemProperty { .. } => OptionKind::PropagateSystemProperty,
            ExamOption::FrameworkStartLevel { .. } => OptionKind::FrameworkStartLevel,
            ExamOption::Timeout { .. } => OptionKind::Timeout,
            ExamOption::CleanCaches { .. } => OptionKind::CleanCaches,
            ExamOption::Repository(_) => OptionKind::Repository,
            ExamOption::HostArgument { .. } => OptionKind::HostArgument,
            ExamOption::Environment { .. } => OptionKind::Environment,
            ExamOption::FailOnUnresolved { .. } => OptionKind::FailOnUnresolved,
        }
    }

    /// Reject malformed options; called when a system is built.
    pub fn validate(&self) -> ExamResult<()> {
        match self {
            ExamOption::Provision(p) => p.validate(),
            ExamOption::Repository(r) => r.repository().map(|_| ()),
            ExamOption::FrameworkStartLevel { level: 0 } => Err(ExamError::configuration(
                "framework start level must be a positive integer",
            )),
            ExamOption::Timeout { millis: 0 } => {
                Err(ExamError::configuration("timeout must be greater than zero"))
            }
            ExamOption::SystemPackage { package } | ExamOption::BootDelegation { package }
                if package.trim().is_empty() =>
            {
                Err(ExamError::configuration(format!("{} must not be empty", self.kind())))
            }
            ExamOption::FrameworkProperty { key, .. }
            | ExamOption::SystemProperty { key, .. }
            | ExamOption::PropagateSystemProperty { key }
                if key.trim().is_empty() =>
            {
                Err(ExamError::configuration(format!("{} key must not be empty", self.kind())))
            }
            ExamOption::Environment { entry } if entry.trim().is_empty() => {
                Err(ExamError::configuration("null or empty environment entry"))
            }
            _ => Ok(()),
        }
    }
}

impl From<ProvisionOption> for ExamOption {
    fn from(option: ProvisionOption) -> Self {
        ExamOption::Provision(option)
    }
}

impl From<RepositoryOption> for ExamOption {
    fn from(option: RepositoryOption) -> Self {
        ExamOption::Repository(option)
    }
}

pub fn provision(url: impl Into<String>) -> ProvisionOption {
    ProvisionOption::new(url)
}

pub fn system_package(package: impl Into<String>) -> ExamOption {
    ExamOption::SystemPackage {
        package: package.into(),
    }
}

pub fn boot_delegation_package(package: impl Into<String>) -> ExamOption {
    ExamOption::BootDelegation {
        package: package.into(),
    }
}

pub fn framework_property(key: impl Into<String>, value: impl Into<String>) -> ExamOption {
    ExamOption::FrameworkProperty {
        key: key.into(),
        value: value.into(),
    }
}

pub fn system_property(key: impl Into<String>, value: impl Into<String>) -> ExamOption {
    ExamOption::SystemProperty {
        key: key.into(),
        value: value.into(),
    }
}

pub fn propagate_system_property(key: impl Into<String>) -> ExamOption {
    ExamOption::PropagateSystemProperty { key: key.into() }
}

pub fn framework_start_level(level: u32) -> ExamOption {
    ExamOption::FrameworkStartLevel { level }
}

pub fn timeout(timeout: Duration) -> ExamOption {
    ExamOption::Timeout {
        millis: timeout.as_millis() as u64,
    }
}

pub fn clean_caches(clean: bool) -> ExamOption {
    ExamOption::CleanCaches { clean }
}

pub fn repository(url: impl Into<String>) -> RepositoryOption {
    RepositoryOption::new(url)
}

pub fn host_argument(argument: impl Into<String>) -> ExamOption {
    ExamOption::HostArgument {
        argument: argument.into(),
    }
}

pub fn environment(entry: impl Into<String>) -> ExamOption {
    ExamOption::Environment {
        entry: entry.into(),
    }
}

pub fn fail_on_unresolved(fail: bool) -> ExamOption {
    ExamOption::FailOnUnresolved { fail }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_defaults() {
        let p = provision("file:/tmp/a.pkar");
        assert!(p.start);
        assert!(!p.update);
        assert_eq!(p.effective_start_level(5), 5);
        assert_eq!(p.clone().start_level(3).effective_start_level(5), 3);
    }

    #[test]
    fn test_zero_start_level_rejected() {
        let option: ExamOption = provision("file:/tmp/a.pkar").start_level(0).into();
        assert!(matches!(option.validate(), Err(ExamError::Configuration(_))));
        assert!(framework_start_level(0).validate().is_err());
    }

    #[test]
    fn test_repository_policy_markers() {
        let repo = repository("https://repo.example.org").allow_snapshots();
        assert_eq!(repo.repository().unwrap(), "https://repo.example.org@snapshots");

        let repo = repository("https://repo.example.org").disable_releases();
        assert!(repo.repository().is_err());

        let repo = repository("https://repo.example.org")
            .allow_snapshots()
            .disable_releases();
        assert_eq!(
            repo.repository().unwrap(),
            "https://repo.example.org@snapshots@noreleases"
        );
    }

    #[test]
    fn test_single_valued_kinds() {
        assert!(!OptionKind::Timeout.allows_multiple());
        assert!(!OptionKind::FrameworkStartLevel.allows_multiple());
        assert!(OptionKind::Provision.allows_multiple());
        assert!(OptionKind::Environment.allows_multiple());
    }

    #[test]
    fn test_option_serde_tagging() {
        let json = serde_json::to_value(framework_property("a", "b")).unwrap();
        assert_eq!(json["kind"], "framework_property");
        let back: ExamOption = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), OptionKind::FrameworkProperty);
    }

    #[test]
    fn test_empty_environment_entry_rejected() {
        assert!(environment("  ").validate().is_err());
        assert!(environment("PATH").validate().is_ok());
    }
}
