use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// A wire frame header did not start with the expected magic.
    #[error("invalid wire magic (expected 0x4E4D \"NM\")")]
    InvalidMagic,

    /// A wire frame declared an unknown payload kind.
    #[error("unknown wire frame kind {0}")]
    UnknownKind(u8),

    /// A text frame was not valid UTF-8.
    #[error("text frame is not valid UTF-8")]
    InvalidUtf8,

    /// A frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The transport is no longer open for writing.
    #[error("transport closed")]
    Closed,

    /// A remote peer reported an error.
    #[error("remote transport error: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
