//! Control-channel wire protocol (spec §4.10, §6): the request verbs, their
//! responses, and the length-prefixed framing that carries both plus the
//! streamed chunks long file/directory transfers need.

pub mod error;
pub mod frame;
pub mod request;
pub mod response;

pub use error::{WireError, WireErrorKind};
pub use frame::{read_frame, write_frame, Frame, RequestId, MAX_FRAME_BYTES};
pub use request::{
    HostStdioPorts, HostsEntryWire, ProxyDirectionWire, ProxySpecWire, Request, StatCategory, WindowSize, WriteFileFlags,
};
pub use response::{ContainerStatsWire, ExitStatusWire, FlatStats, InterfaceStatsWire, Response};
