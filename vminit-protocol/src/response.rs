//! Responses to the verbs in [`crate::request::Request`] (spec §4.10: "All
//! handlers return small typed responses; long transfers use request or
//! response streams").

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// An exited process's terminal state (spec §3 "Managed process":
/// `exited(code, when)`), with the timestamp as epoch milliseconds to keep
/// this crate's dependency footprint to `serde`/`serde_json` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatusWire {
    pub code: i32,
    pub exited_at_epoch_millis: i64,
}

/// Per-interface network counters (mirrors `vminit_netlink::InterfaceStats`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStatsWire {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

/// Flat `key: value` lines as read out of a cgroup stat file, preserving
/// file order.
pub type FlatStats = Vec<(String, String)>;

/// The categories actually populated by one `GetStats` answer for a single
/// container; a category absent from the request is `None` here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatsWire {
    pub container_id: String,
    #[serde(default)]
    pub process_count: Option<usize>,
    #[serde(default)]
    pub memory_current_bytes: Option<u64>,
    #[serde(default)]
    pub memory_stat: Option<FlatStats>,
    #[serde(default)]
    pub memory_events: Option<FlatStats>,
    #[serde(default)]
    pub cpu_stat: Option<FlatStats>,
    #[serde(default)]
    pub io_stat_raw: Option<String>,
    #[serde(default)]
    pub network: Option<Vec<(String, InterfaceStatsWire)>>,
}

/// The answer to one [`crate::request::Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Response {
    /// The request succeeded and carries no data beyond that.
    Ack,
    Error(WireError),
    Pid { pid: i32 },
    ExitStatus(ExitStatusWire),
    EnvValue { value: Option<String> },
    Stats { containers: Vec<ContainerStatsWire> },
    /// The init response for an out-copy (spec §4.10 "Filesystem utilities":
    /// "out (init chunk declares total size)"). A run of `ResponseChunk`
    /// frames carrying the bytes, then `ResponseChunkEnd`, follow.
    FileSize { total_bytes: u64 },
}

impl Response {
    pub fn error(err: impl Into<WireError>) -> Self {
        Self::Error(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireErrorKind;

    #[test]
    fn response_error_round_trips() {
        let resp = Response::Error(WireError {
            kind: WireErrorKind::NotFound,
            op: "wait_process".to_string(),
            message: "no such exec".to_string(),
        });
        let encoded = serde_json::to_string(&resp).unwrap();
        let decoded: Response = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Response::Error(e) => {
                assert_eq!(e.kind, WireErrorKind::NotFound);
                assert_eq!(e.op, "wait_process");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn ack_is_a_unit_variant_on_the_wire() {
        let encoded = serde_json::to_string(&Response::Ack).unwrap();
        assert_eq!(encoded, r#"{"op":"ack"}"#);
    }
}
