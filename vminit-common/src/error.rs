use thiserror::Error;

/// The error taxonomy surfaced to the host over the control channel.
///
/// Every request handler returns at most one of these, never a raw OS
/// errno or library error type — callers on the host side match on `kind`,
/// not on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
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

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid-argument",
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::InvalidState => "invalid-state",
            Self::Unsupported => "unsupported",
            Self::Internal => "internal",
            Self::Interrupted => "interrupted",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Empty => "empty",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A taxonomy-tagged, operation-scoped error.
#[derive(Error, Debug)]
#[error("{op}: {message}{}", .source.as_ref().map(|e| format!(" ({e})")).unwrap_or_default())]
pub struct AgentError {
    pub kind: ErrorKind,
    pub op: String,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl AgentError {
    pub fn new(kind: ErrorKind, op: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            op: op.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        op: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            op: op.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_found(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, op, message)
    }

    pub fn invalid_state(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, op, message)
    }

    pub fn already_exists(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, op, message)
    }

    pub fn invalid_argument(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, op, message)
    }

    /// Wrap an OS errno-bearing error as `internal`, surfacing the errno in the message.
    pub fn from_errno(op: impl Into<String>, err: std::io::Error) -> Self {
        let op = op.into();
        let message = match err.raw_os_error() {
            Some(errno) => format!("{err} (errno {errno})"),
            None => err.to_string(),
        };
        Self {
            kind: ErrorKind::Internal,
            op,
            message,
            source: Some(Box::new(err)),
        }
    }

    /// A marshal/unmarshal failure per the byte codec contract: `marshal(type, field, direction)`.
    pub fn marshal(ty: &str, field: &str, direction: &str) -> Self {
        Self::new(
            ErrorKind::InvalidArgument,
            "marshal",
            format!("{ty}.{field}: failed to {direction}"),
        )
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_round_trips_to_str() {
        assert_eq!(ErrorKind::NotFound.as_str(), "not-found");
        assert_eq!(ErrorKind::AlreadyExists.to_string(), "already-exists");
    }

    #[test]
    fn marshal_error_names_type_field_direction() {
        let err = AgentError::marshal("RouterAdvertisement", "reachableTime", "bind");
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(err.message.contains("RouterAdvertisement"));
        assert!(err.message.contains("reachableTime"));
        assert!(err.message.contains("bind"));
    }
}
