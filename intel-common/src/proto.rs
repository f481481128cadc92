//! Wire messages exchanged between the shim, the agent, and the collector.
//!
//! Messages are hand-derived prost structs. The shim encodes a single
//! [`ReportInvocationRequest`] onto the loopback transport; the agent and
//! collector exchange the remaining messages over the RPC layer.

use prost::Message;

/// Dial timeout for the loopback stream transport.
pub const LOOPBACK_DIAL_TIMEOUT_MS: u64 = 100;

/// Default TCP address of the loopback transport when datagram mode is
/// unavailable.
pub const LOOPBACK_TCP_ADDRESS: &str = "127.0.0.1:13657";

/// Environment variable overriding the loopback transport address.
pub const DAEMON_ADDRESS_ENV: &str = "CODER_INTEL_DAEMON_ADDRESS";

/// Environment variable overriding the loopback dial timeout (milliseconds).
pub const DAEMON_TIMEOUT_ENV: &str = "CODER_INTEL_DAEMON_TIMEOUT";

/// Basename of the loopback datagram socket, created under the temp dir.
pub const DAEMON_SOCKET_NAME: &str = ".coder-intel.sock";

/// Sent by the shim to the agent after a tracked binary finishes.
#[derive(Clone, PartialEq, Message)]
pub struct ReportInvocationRequest {
    #[prost(string, tag = "1")]
    pub executable_path: String,
    #[prost(string, repeated, tag = "2")]
    pub arguments: Vec<String>,
    #[prost(string, tag = "3")]
    pub working_directory: String,
    #[prost(int64, tag = "4")]
    pub duration_ms: i64,
    #[prost(int32, tag = "5")]
    pub exit_code: i32,
}

/// Identity of a tracked binary, coalesced by the agent's executable cache.
#[derive(Clone, PartialEq, Message)]
pub struct Executable {
    #[prost(string, tag = "1")]
    pub hash: String,
    #[prost(string, tag = "2")]
    pub basename: String,
    #[prost(string, tag = "3")]
    pub path: String,
    #[prost(string, tag = "4")]
    pub version: String,
}

/// One enriched invocation record, as uploaded to the collector.
#[derive(Clone, PartialEq, Message)]
pub struct Invocation {
    #[prost(message, optional, tag = "1")]
    pub executable: Option<Executable>,
    #[prost(string, repeated, tag = "2")]
    pub arguments: Vec<String>,
    #[prost(string, tag = "3")]
    pub working_directory: String,
    #[prost(string, tag = "4")]
    pub git_remote_url: String,
    #[prost(int32, tag = "5")]
    pub exit_code: i32,
    #[prost(int64, tag = "6")]
    pub duration_ms: i64,
}

/// A batch of invocations uploaded over the data plane.
#[derive(Clone, PartialEq, Message)]
pub struct RecordInvocationRequest {
    #[prost(message, repeated, tag = "1")]
    pub invocations: Vec<Invocation>,
}

/// Inventory of software installed on the machine. Reserved.
#[derive(Clone, PartialEq, Message)]
pub struct InstalledSoftware {}

/// Opens the control-plane stream and reports static host facts.
#[derive(Clone, PartialEq, Message)]
pub struct ListenRequest {
    #[prost(string, tag = "1")]
    pub git_config_email: String,
    #[prost(string, tag = "2")]
    pub git_config_name: String,
    #[prost(message, optional, tag = "3")]
    pub installed_software: Option<InstalledSoftware>,
}

/// The complete desired set of tracked basenames for the host.
#[derive(Clone, PartialEq, Message)]
pub struct TrackExecutables {
    #[prost(string, repeated, tag = "1")]
    pub binary_name: Vec<String>,
}

/// Server-to-agent directive pushed on the control plane.
#[derive(Clone, PartialEq, Message)]
pub struct SystemResponse {
    #[prost(oneof = "system_response::Msg", tags = "1")]
    pub msg: Option<system_response::Msg>,
}

pub mod system_response {
    /// Variants of [`super::SystemResponse`].
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        TrackExecutables(super::TrackExecutables),
    }
}

/// Reserved.
#[derive(Clone, PartialEq, Message)]
pub struct ReportPathRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

/// Empty RPC response.
#[derive(Clone, PartialEq, Message)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_invocation_roundtrip() {
        let req = ReportInvocationRequest {
            executable_path: "/usr/bin/go".into(),
            arguments: vec!["build".into(), "./...".into()],
            working_directory: "/home/coder/project".into(),
            duration_ms: 1234,
            exit_code: 2,
        };
        let bytes = req.encode_to_vec();
        let decoded = ReportInvocationRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn system_response_oneof_roundtrip() {
        let resp = SystemResponse {
            msg: Some(system_response::Msg::TrackExecutables(TrackExecutables {
                binary_name: vec!["go".into(), "node".into()],
            })),
        };
        let decoded = SystemResponse::decode(resp.encode_to_vec().as_slice()).unwrap();
        assert_eq!(resp, decoded);
    }

    #[test]
    fn empty_invocation_decodes() {
        let inv = Invocation::decode(&[][..]).unwrap();
        assert!(inv.executable.is_none());
        assert_eq!(inv.exit_code, 0);
    }
}
