//! Well-known start levels, header names and property keys.

use std::time::Duration;

/// Start level of bundles the runtime needs before anything else.
pub const START_LEVEL_SYSTEM_BUNDLES: u32 = 1;
/// Start level given to provisioned units that do not request one.
pub const START_LEVEL_DEFAULT_PROVISION: u32 = 5;
/// Elevated start level reserved for probes and other test artifacts.
/// Also the default target level of the runtime.
pub const START_LEVEL_TEST_BUNDLE: u32 = 15;

/// Default for every bounded wait when no timeout option is declared.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(180_000);
/// Extra time granted to the shutdown watchdog on top of the timeout.
pub const STOP_WATCHDOG_GRACE: Duration = Duration::from_millis(500);
/// Upper bound on the shutdown wait after a failed start.
pub const ABORTED_START_STOP_TIMEOUT: Duration = Duration::from_secs(1);

pub const HEADER_SYMBOLIC_NAME: &str = "Bundle-SymbolicName";
pub const HEADER_VERSION: &str = "Bundle-Version";
pub const HEADER_IMPORT_PACKAGE: &str = "Import-Package";
pub const HEADER_EXPORT_PACKAGE: &str = "Export-Package";
pub const HEADER_DYNAMIC_IMPORT: &str = "DynamicImport-Package";
pub const HEADER_ACTIVATOR: &str = "Bundle-Activator";
pub const HEADER_IGNORE_PACKAGE: &str = "Ignore-Package";
/// Address table of a probe: `identifier=owner;method` entries.
pub const HEADER_EXECUTABLE: &str = "Probekit-Executable";

/// Service class of the per-address probe invoker.
pub const PROBE_INVOKER_CLASS: &str = "probekit.ProbeInvoker";
pub const OBJECT_CLASS: &str = "objectClass";
/// Service property carrying the root identifier of a test address.
pub const PROBE_SIGNATURE_KEY: &str = "Probe-Signature";

pub const FRAMEWORK_STORAGE: &str = "org.osgi.framework.storage";
pub const FRAMEWORK_STORAGE_CLEAN: &str = "org.osgi.framework.storage.clean";
pub const FRAMEWORK_STORAGE_CLEAN_ONFIRSTINIT: &str = "onFirstInit";
pub const FRAMEWORK_SYSTEMPACKAGES_EXTRA: &str = "org.osgi.framework.system.packages.extra";
pub const FRAMEWORK_BOOTDELEGATION: &str = "org.osgi.framework.bootdelegation";
/// Repositories the provisioning collaborator may resolve artifacts from.
pub const REPOSITORIES_PROPERTY: &str = "probekit.url.repositories";

/// System property naming the port on which test outcomes are reported.
pub const INVOKER_PORT_PROPERTY: &str = "probekit.invoker.port";

pub const ENV_TIMEOUT_MS: &str = "PROBEKIT_TIMEOUT_MS";
pub const ENV_FAIL_ON_UNRESOLVED: &str = "PROBEKIT_FAIL_ON_UNRESOLVED";
pub const ENV_INVOKER_PORT: &str = "PROBEKIT_INVOKER_PORT";
pub const ENV_INVOKER_PORT_RANGE_LOWERBOUND: &str = "PROBEKIT_INVOKER_PORT_RANGE_LOWERBOUND";
pub const ENV_INVOKER_PORT_RANGE_UPPERBOUND: &str = "PROBEKIT_INVOKER_PORT_RANGE_UPPERBOUND";

pub const DEFAULT_INVOKER_PORT_RANGE: (u16, u16) = (20_000, 21_000);
