use thiserror::Error;

/// Errors that can occur in the proxy core.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("outbound I/O error: {0}")]
    OutboundIo(std::io::Error),

    #[error("persistent UDP receive failure: {0}")]
    UdpReceiveFailure(std::io::Error),

    #[error("slot is busy")]
    Busy,

    #[error("no available slots")]
    NoSlot,

    #[error("no available workers")]
    NoWorker,

    #[error("configuration error: {0}")]
    BadConfig(String),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl ProxyError {
    /// Classify a raw I/O error the way the rest of the core expects:
    /// hang-ups are quiet (`PeerClosed`), everything else is reported.
    pub fn classify_peer_io(err: std::io::Error) -> ProxyError {
        use std::io::ErrorKind::*;
        match err.kind() {
            ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected | UnexpectedEof => {
                ProxyError::PeerClosed
            }
            _ => ProxyError::Io(err),
        }
    }

    /// True for errors that should end this client's session quietly
    /// (no WARN-level log, no slot drop) versus errors worth logging.
    pub fn is_quiet_hangup(&self) -> bool {
        matches!(self, ProxyError::PeerClosed)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
