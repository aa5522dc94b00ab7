//! Environment construction for spawned runtime hosts.
//!
//! An entry `NAME=value` sets `NAME` to `value`; a bare `NAME` propagates the
//! parent's current value and fails if the parent does not define it. A
//! host sees exactly the declared variables, none when nothing is declared.

use std::collections::BTreeMap;

use probekit_core::{ExamError, ExamResult};

/// Build the child environment from `entries`, resolving bare names against
/// `parent`.
pub fn prepare_environment(
    entries: &[String],
    parent: &BTreeMap<String, String>,
) -> ExamResult<BTreeMap<String, String>> {
    let mut environment = BTreeMap::new();
    for raw in entries {
        let entry = raw.trim();
        if entry.is_empty() {
            return Err(ExamError::configuration("null or empty environment entry"));
        }
        let (key, value) = match entry.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim().to_string()),
            None => {
                let value = parent.get(entry).ok_or_else(|| {
                    ExamError::configuration(format!(
                        "environment variable {entry} is not set in the parent process"
                    ))
                })?;
                (entry, value.clone())
            }
        };
        if key.is_empty() {
            return Err(ExamError::configuration(format!(
                "environment entry '{entry}' has an empty name"
            )));
        }
        if environment.insert(key.to_string(), value).is_some() {
            return Err(ExamError::configuration(format!(
                "environment variable {key} is declared more than once"
            )));
        }
    }
    Ok(environment)
}

/// The current process environment as a sorted map.
pub fn parent_environment() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("ACME_HOME".to_string(), "/opt/acme".to_string()),
            ("ACME_MODE".to_string(), "parent".to_string()),
        ])
    }

    fn entries(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_override_wins_over_parent_value() {
        let env = prepare_environment(&entries(&["ACME_MODE=child"]), &parent()).unwrap();
        assert_eq!(env["ACME_MODE"], "child");
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_bare_name_propagates_parent_value() {
        let env = prepare_environment(&entries(&[" ACME_HOME "]), &parent()).unwrap();
        assert_eq!(env["ACME_HOME"], "/opt/acme");
    }

    #[test]
    fn test_override_name_and_value_are_trimmed() {
        let env = prepare_environment(&entries(&["ACME_MODE =  child "]), &parent()).unwrap();
        assert_eq!(env["ACME_MODE"], "child");
    }

    #[test]
    fn test_no_entries_means_empty_environment() {
        assert!(prepare_environment(&[], &parent()).unwrap().is_empty());
    }

    #[test]
    fn test_value_may_contain_equals() {
        let env = prepare_environment(&entries(&["ACME_OPTS=a=1,b=2"]), &parent()).unwrap();
        assert_eq!(env["ACME_OPTS"], "a=1,b=2");
    }

    #[test]
    fn test_missing_parent_variable_is_named() {
        let err = prepare_environment(&entries(&["ACME_ABSENT"]), &parent()).unwrap_err();
        assert!(matches!(err, ExamError::Configuration(_)));
        assert!(err.to_string().contains("ACME_ABSENT"));
    }

    #[test]
    fn test_malformed_entries_are_rejected() {
        assert!(prepare_environment(&entries(&["  "]), &parent())
            .unwrap_err()
            .to_string()
            .contains("empty environment entry"));
        assert!(prepare_environment(&entries(&["=value"]), &parent())
            .unwrap_err()
            .to_string()
            .contains("empty name"));
        assert!(prepare_environment(&entries(&["ACME_MODE=a", "ACME_MODE"]), &parent())
            .unwrap_err()
            .to_string()
            .contains("more than once"));
    }
}
