//! RPC messages between a forked container and its runtime host.
//!
//! Every request carries an id echoed by its response. Byte content travels
//! hex-encoded; failures travel as [`FrameworkError`] so test failures reach
//! the caller unwrapped.

use probekit_core::framework::{BundleId, FrameworkError, ServiceReference};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Line a runtime host prints on stdout once its RPC port is open,
/// followed by the port number.
pub const LISTENING_PREFIX: &str = "probekit-host listening on ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    Init,
    Start,
    Stop,
    WaitForStop { timeout_ms: u64 },
    State,
    InstallBundle { location: String, content: Option<String> },
    UpdateBundle { id: BundleId, content: Option<String> },
    StartBundle { id: BundleId },
    UninstallBundle { id: BundleId },
    BundleState { id: BundleId },
    BundleInfo { id: BundleId },
    Bundles,
    SetBundleStartLevel { id: BundleId, level: u32 },
    SetStartLevel { level: u32 },
    StartLevel,
    /// Move to `level` and answer `true` once reached, `false` on timeout.
    SetStartLevelAndWait { level: u32, timeout_ms: u64 },
    FindServices { filter: String, timeout_ms: u64 },
    InvokeService {
        service: ServiceReference,
        method: String,
        args: Vec<Value>,
    },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Init => "init",
            Call::Start => "start",
            Call::Stop => "stop",
            Call::WaitForStop { .. } => "wait_for_stop",
            Call::State => "state",
            Call::InstallBundle { .. } => "install_bundle",
            Call::UpdateBundle { .. } => "update_bundle",
            Call::StartBundle { .. } => "start_bundle",
            Call::UninstallBundle { .. } => "uninstall_bundle",
            Call::BundleState { .. } => "bundle_state",
            Call::BundleInfo { .. } => "bundle_info",
            Call::Bundles => "bundles",
            Call::SetBundleStartLevel { .. } => "set_bundle_start_level",
            Call::SetStartLevel { .. } => "set_start_level",
            Call::StartLevel => "start_level",
            Call::SetStartLevelAndWait { .. } => "set_start_level_and_wait",
            Call::FindServices { .. } => "find_services",
            Call::InvokeService { .. } => "invoke_service",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<Value, FrameworkError>,
}

pub fn encode_content(content: Option<Vec<u8>>) -> Option<String> {
    content.map(hex::encode)
}

pub fn decode_content(content: Option<String>) -> Result<Option<Vec<u8>>, FrameworkError> {
    content
        .map(|c| {
            hex::decode(c).map_err(|e| FrameworkError::Transport {
                message: format!("bad content encoding: {e}"),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use probekit_core::TestFailure;

    #[test]
    fn test_fault_response_keeps_test_failure() {
        let response = Response {
            id: 7,
            result: Err(FrameworkError::Invocation(TestFailure::assertion("expected 3"))),
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_content_hex_encoding() {
        let encoded = encode_content(Some(vec![0xde, 0xad]));
        assert_eq!(encoded.as_deref(), Some("dead"));
        assert_eq!(decode_content(encoded).unwrap(), Some(vec![0xde, 0xad]));
        assert!(decode_content(Some("zz".into())).is_err());
        assert_eq!(decode_content(None).unwrap(), None);
    }

    #[test]
    fn test_call_tagging() {
        let call = Call::SetStartLevelAndWait {
            level: 15,
            timeout_ms: 500,
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["op"], "set_start_level_and_wait");
        assert_eq!(call.name(), "set_start_level_and_wait");
    }
}
