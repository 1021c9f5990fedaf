//! Stream proxy specification (spec §3 "Stream proxy").

/// Which side listens and which side is dialed per accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyDirection {
    /// Listen on a UNIX socket path, dial the host over vsock.
    ListenUnixDialVsock,
    /// Listen on a vsock port, dial a UNIX socket path.
    ListenVsockDialUnix,
}

#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub id: String,
    pub direction: ProxyDirection,
    /// The vsock port, on whichever side of the pair it applies to.
    pub port: u32,
    /// The filesystem path, on whichever side of the pair it applies to.
    pub path: std::path::PathBuf,
    /// UNIX socket file mode; `None` leaves the process umask in effect.
    pub permissions: Option<u32>,
}
