//! Exam system: the immutable option registry a container is built from,
//! plus the temp working area it owns.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{ExamError, ExamResult};
use crate::options::{ExamOption, OptionKind, ProvisionOption};
use crate::settings::ExamSettings;

/// Immutable-after-build option set with an isolated temp directory.
///
/// `fork` never mutates: it layers extra options onto a copy and gives the
/// child its own temp directory. Each system is owned by exactly one
/// container; `clear` releases its directory.
#[derive(Debug)]
pub struct ExamSystem {
    options: Arc<Vec<ExamOption>>,
    settings: Arc<ExamSettings>,
    temp: Option<TempDir>,
    temp_path: PathBuf,
}

impl ExamSystem {
    /// Validate `options` and create the system's working area.
    pub fn new(options: Vec<ExamOption>, settings: ExamSettings) -> ExamResult<Self> {
        for option in &options {
            option.validate()?;
        }
        let system = Self::with_shared(Arc::new(options), Arc::new(settings))?;
        system.check_single_valued()?;
        Ok(system)
    }

    fn with_shared(options: Arc<Vec<ExamOption>>, settings: Arc<ExamSettings>) -> ExamResult<Self> {
        let temp = tempfile::Builder::new().prefix("probekit-").tempdir()?;
        let temp_path = temp.path().to_path_buf();
        debug!(path = %temp_path.display(), "created exam system working area");
        Ok(Self {
            options,
            settings,
            temp: Some(temp),
            temp_path,
        })
    }

    fn check_single_valued(&self) -> ExamResult<()> {
        for kind in [
            OptionKind::FrameworkStartLevel,
            OptionKind::Timeout,
            OptionKind::CleanCaches,
            OptionKind::FailOnUnresolved,
        ] {
            self.single_option(kind)?;
        }
        Ok(())
    }

    /// Derive a system with `extra` options layered on top and a fresh
    /// working area. The parent is left untouched.
    pub fn fork(&self, extra: Vec<ExamOption>) -> ExamResult<ExamSystem> {
        for option in &extra {
            option.validate()?;
        }
        let mut options = self.options.as_ref().clone();
        options.extend(extra);
        let child = Self::with_shared(Arc::new(options), Arc::clone(&self.settings))?;
        child.check_single_valued()?;
        Ok(child)
    }

    /// Release the working area. Safe to call more than once.
    pub fn clear(&mut self) {
        if let Some(temp) = self.temp.take() {
            let path = temp.path().to_path_buf();
            if let Err(e) = temp.close() {
                warn!(path = %path.display(), error = %e, "failed to remove exam system working area");
            } else {
                debug!(path = %path.display(), "removed exam system working area");
            }
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.temp.is_none()
    }

    /// Working area of this system.
    pub fn temp_folder(&self) -> ExamResult<&Path> {
        if self.temp.is_none() {
            return Err(ExamError::container(format!(
                "exam system working area {} has been released",
                self.temp_path.display()
            )));
        }
        Ok(&self.temp_path)
    }

    pub fn settings(&self) -> &ExamSettings {
        &self.settings
    }

    pub fn all_options(&self) -> &[ExamOption] {
        &self.options
    }

    /// All options of `kind`, in declaration order.
    pub fn options(&self, kind: OptionKind) -> Vec<&ExamOption> {
        self.options.iter().filter(|o| o.kind() == kind).collect()
    }

    /// The single option of `kind`, if declared. Declaring a single-valued
    /// kind more than once is a configuration error.
    pub fn single_option(&self, kind: OptionKind) -> ExamResult<Option<&ExamOption>> {
        let mut matching = self.options.iter().filter(|o| o.kind() == kind);
        let first = matching.next();
        if first.is_some() && matching.next().is_some() && !kind.allows_multiple() {
            return Err(ExamError::configuration(format!(
                "option {kind} must be declared at most once"
            )));
        }
        Ok(first)
    }

    pub fn provision_options(&self) -> Vec<&ProvisionOption> {
        self.options
            .iter()
            .filter_map(|o| match o {
                ExamOption::Provision(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Declared timeout, or the settings default.
    pub fn timeout(&self) -> Duration {
        match self.single_option(OptionKind::Timeout) {
            Ok(Some(ExamOption::Timeout { millis })) => Duration::from_millis(*millis),
            _ => self.settings.timeout,
        }
    }

    pub fn framework_start_level(&self) -> Option<u32> {
        match self.single_option(OptionKind::FrameworkStartLevel) {
            Ok(Some(ExamOption::FrameworkStartLevel { level })) => Some(*level),
            _ => None,
        }
    }

    pub fn clean_caches(&self) -> bool {
        matches!(
            self.single_option(OptionKind::CleanCaches),
            Ok(Some(ExamOption::CleanCaches { clean: true }))
        )
    }

    /// Option override first, then the process-level setting.
    pub fn fail_on_unresolved(&self) -> bool {
        match self.single_option(OptionKind::FailOnUnresolved) {
            Ok(Some(ExamOption::FailOnUnresolved { fail })) => *fail,
            _ => self.settings.fail_on_unresolved,
        }
    }

    /// Values of string-valued options of `kind`, joined with `,`.
    pub fn joined_values(&self, kind: OptionKind) -> ExamResult<String> {
        let mut values = Vec::new();
        for option in self.options(kind) {
            let value = match option {
                ExamOption::SystemPackage { package } | ExamOption::BootDelegation { package } => {
                    package.clone()
                }
                ExamOption::Repository(repo) => repo.repository()?,
                ExamOption::HostArgument { argument } => argument.clone(),
                other => {
                    return Err(ExamError::configuration(format!(
                        "option {} has no single value",
                        other.kind()
                    )))
                }
            };
            values.push(value);
        }
        Ok(values.join(","))
    }

    /// Key/value pairs of framework properties in declaration order.
    pub fn framework_properties(&self) -> Vec<(String, String)> {
        self.options
            .iter()
            .filter_map(|o| match o {
                ExamOption::FrameworkProperty { key, value } => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Key/value pairs of system properties in declaration order.
    pub fn system_properties(&self) -> Vec<(String, String)> {
        self.options
            .iter()
            .filter_map(|o| match o {
                ExamOption::SystemProperty { key, value } => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }
}

impl Drop for ExamSystem {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{framework_property, framework_start_level, provision, system_package, timeout};

    #[test]
    fn test_fork_layers_options_without_mutating_parent() {
        let parent = ExamSystem::new(vec![system_package("org.acme.api")], ExamSettings::default()).unwrap();
        let child = parent
            .fork(vec![system_package("org.acme.spi"), framework_property("k", "v")])
            .unwrap();

        assert_eq!(parent.all_options().len(), 1);
        assert_eq!(child.all_options().len(), 3);
        assert_eq!(child.joined_values(OptionKind::SystemPackage).unwrap(), "org.acme.api,org.acme.spi");
        assert_ne!(parent.temp_folder().unwrap(), child.temp_folder().unwrap());
    }

    #[test]
    fn test_clear_releases_working_area() {
        let mut system = ExamSystem::new(vec![], ExamSettings::default()).unwrap();
        let path = system.temp_folder().unwrap().to_path_buf();
        assert!(path.exists());
        system.clear();
        system.clear();
        assert!(!path.exists());
        assert!(system.is_cleared());
        assert!(system.temp_folder().is_err());
    }

    #[test]
    fn test_forked_child_cleared_independently() {
        let parent = ExamSystem::new(vec![], ExamSettings::default()).unwrap();
        let mut child = parent.fork(vec![]).unwrap();
        child.clear();
        assert!(parent.temp_folder().unwrap().exists());
    }

    #[test]
    fn test_duplicate_single_valued_option_rejected() {
        let err = ExamSystem::new(
            vec![framework_start_level(10), framework_start_level(20)],
            ExamSettings::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("framework_start_level"));
    }

    #[test]
    fn test_timeout_falls_back_to_settings() {
        let settings = ExamSettings::default().with_timeout(Duration::from_secs(7));
        let system = ExamSystem::new(vec![], settings.clone()).unwrap();
        assert_eq!(system.timeout(), Duration::from_secs(7));

        let system = ExamSystem::new(vec![timeout(Duration::from_millis(300))], settings).unwrap();
        assert_eq!(system.timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_provision_options_in_declaration_order() {
        let system = ExamSystem::new(
            vec![
                provision("file:/a").into(),
                system_package("x"),
                provision("file:/b").no_start().into(),
            ],
            ExamSettings::default(),
        )
        .unwrap();
        let urls: Vec<&str> = system.provision_options().iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["file:/a", "file:/b"]);
    }

    #[test]
    fn test_invalid_option_rejected_at_build() {
        let err = ExamSystem::new(vec![provision("  ").into()], ExamSettings::default()).unwrap_err();
        assert!(matches!(err, ExamError::Configuration(_)));
    }
}
