//! Wire form of [`vminit_common::ErrorKind`] and [`vminit_common::AgentError`]
//! (spec §7): every handler failure crosses the control channel as one of
//! these, never a raw OS errno or library error type.

use serde::{Deserialize, Serialize};
use vminit_common::{AgentError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
    Unsupported,
    Internal,
    Interrupted,
    Timeout,
    Cancelled,
    Empty,
    Unknown,
}

impl From<ErrorKind> for WireErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidArgument => Self::InvalidArgument,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::InvalidState => Self::InvalidState,
            ErrorKind::Unsupported => Self::Unsupported,
            ErrorKind::Internal => Self::Internal,
            ErrorKind::Interrupted => Self::Interrupted,
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::Empty => Self::Empty,
            ErrorKind::Unknown => Self::Unknown,
        }
    }
}

/// A taxonomy-tagged, operation-scoped error as it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub op: String,
    pub message: String,
}

impl From<&AgentError> for WireError {
    fn from(err: &AgentError) -> Self {
        Self {
            kind: err.kind.into(),
            op: err.op.clone(),
            message: err.message.clone(),
        }
    }
}

impl From<AgentError> for WireError {
    fn from(err: AgentError) -> Self {
        Self::from(&err)
    }
}
