//! Process-level harness settings, resolved once and threaded through
//! every exam system and container.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_INVOKER_PORT_RANGE, DEFAULT_TIMEOUT, ENV_FAIL_ON_UNRESOLVED, ENV_INVOKER_PORT,
    ENV_INVOKER_PORT_RANGE_LOWERBOUND, ENV_INVOKER_PORT_RANGE_UPPERBOUND, ENV_TIMEOUT_MS,
};
use crate::error::{ExamError, ExamResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamSettings {
    /// Bound for start-level, shutdown and service-lookup waits.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Escalate unresolved components found after start to a fatal error.
    pub fail_on_unresolved: bool,
    /// Fixed port for test outcome callbacks; otherwise a free port from
    /// `invoker_port_range` is used.
    pub invoker_port: Option<u16>,
    pub invoker_port_range: (u16, u16),
}

impl Default for ExamSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            fail_on_unresolved: false,
            invoker_port: None,
            invoker_port_range: DEFAULT_INVOKER_PORT_RANGE,
        }
    }
}

impl ExamSettings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> ExamResult<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Resolve settings from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> ExamResult<Self> {
        let mut settings = Self::default();
        if let Some(ms) = parse_var::<u64>(vars, ENV_TIMEOUT_MS)? {
            settings.timeout = Duration::from_millis(ms);
        }
        if let Some(fail) = parse_var::<bool>(vars, ENV_FAIL_ON_UNRESOLVED)? {
            settings.fail_on_unresolved = fail;
        }
        settings.invoker_port = parse_var::<u16>(vars, ENV_INVOKER_PORT)?;
        let lower = parse_var::<u16>(vars, ENV_INVOKER_PORT_RANGE_LOWERBOUND)?
            .unwrap_or(DEFAULT_INVOKER_PORT_RANGE.0);
        let upper = parse_var::<u16>(vars, ENV_INVOKER_PORT_RANGE_UPPERBOUND)?
            .unwrap_or(DEFAULT_INVOKER_PORT_RANGE.1);
        if lower > upper {
            return Err(ExamError::configuration(format!(
                "invoker port range is empty: {lower} > {upper}"
            )));
        }
        settings.invoker_port_range = (lower, upper);
        Ok(settings)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fail_on_unresolved(mut self, fail: bool) -> Self {
        self.fail_on_unresolved = fail;
        self
    }
}

fn parse_var<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str) -> ExamResult<Option<T>> {
    match vars.get(key).map(|v| v.trim()) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ExamError::configuration(format!("{key} has invalid value '{raw}'"))),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_lenient() {
        let settings = ExamSettings::from_vars(&HashMap::new()).unwrap();
        assert_eq!(settings, ExamSettings::default());
        assert!(!settings.fail_on_unresolved);
        assert_eq!(settings.invoker_port_range, (20_000, 21_000));
    }

    #[test]
    fn test_overrides_from_vars() {
        let settings = ExamSettings::from_vars(&vars(&[
            ("PROBEKIT_TIMEOUT_MS", "2500"),
            ("PROBEKIT_FAIL_ON_UNRESOLVED", "true"),
            ("PROBEKIT_INVOKER_PORT", "20123"),
        ]))
        .unwrap();
        assert_eq!(settings.timeout, Duration::from_millis(2500));
        assert!(settings.fail_on_unresolved);
        assert_eq!(settings.invoker_port, Some(20123));
    }

    #[test]
    fn test_malformed_value_is_configuration_error() {
        let err = ExamSettings::from_vars(&vars(&[("PROBEKIT_INVOKER_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ExamError::Configuration(_)));
        assert!(err.to_string().contains("PROBEKIT_INVOKER_PORT"));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let err = ExamSettings::from_vars(&vars(&[
            ("PROBEKIT_INVOKER_PORT_RANGE_LOWERBOUND", "30000"),
            ("PROBEKIT_INVOKER_PORT_RANGE_UPPERBOUND", "20000"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("port range"));
    }
}
