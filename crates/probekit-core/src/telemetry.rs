//! Tracing setup for the runtime host and test runs.
//!
//! Output always goes to stderr: the host's stdout carries the port
//! handshake. Without `RUST_LOG` the filter is scoped to the Probekit
//! crates and everything else is held at `warn`. A forked host only sees
//! `RUST_LOG` when a container declares it through an environment option.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Targets that follow the requested level when `RUST_LOG` is unset.
pub const PROBEKIT_TARGETS: &[&str] = &["probekit_core", "probekit_remote", "probekit_host"];

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(PROBEKIT_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber. Later calls are ignored.
///
/// `json` switches to newline-delimited JSON. A forked host inherits the
/// parent's stderr, so its lines interleave with the test run's own.
pub fn init_tracing(json: bool, level: Level) {
    let layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter(level));
    let installed = if json {
        registry.with(layer.json().with_current_span(true)).try_init()
    } else {
        registry.with(layer.with_target(false)).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_probekit_crates() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,probekit_core=debug,probekit_remote=debug,probekit_host=debug"
        );
    }

    #[test]
    fn test_default_directives_parse() {
        for level in [Level::ERROR, Level::INFO, Level::TRACE] {
            let directives = default_directives(level);
            assert!(directives.parse::<EnvFilter>().is_ok(), "{directives}");
        }
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}
