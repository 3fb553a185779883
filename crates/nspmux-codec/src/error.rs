/// Errors raised while encoding or decoding protocol packets.
///
/// Any decode error is fatal for the connection it came from: once the
/// attachment state machine is out of step, the stream cannot resynchronize.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame was empty.
    #[error("empty frame")]
    EmptyFrame,

    /// The packet type digit is not part of the protocol.
    #[error("unknown packet type {0:?}")]
    UnknownType(char),

    /// The attachment count of a binary packet is missing or malformed.
    #[error("invalid attachment count")]
    InvalidAttachments,

    /// A binary packet declares more attachments than allowed.
    #[error("too many attachments ({count}, max {max})")]
    TooManyAttachments { count: usize, max: usize },

    /// A placeholder references an attachment that does not exist.
    #[error("invalid attachment placeholder {num} (packet has {count})")]
    InvalidPlaceholder { num: u64, count: usize },

    /// A binary packet carries attachments no placeholder refers to.
    #[error("{count} attachments declared but only {referenced} referenced")]
    UnusedAttachments { referenced: usize, count: usize },

    /// The JSON body failed to parse.
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The payload shape does not match the packet type.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A binary frame arrived while no binary packet was being reconstructed.
    #[error("unexpected binary frame")]
    UnexpectedBinary,

    /// A text frame arrived while binary attachments were still outstanding.
    #[error("unexpected text frame while awaiting {remaining} binary attachment(s)")]
    UnexpectedText { remaining: usize },

    /// The frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The stream ended with binary attachments still outstanding.
    #[error("stream ended while awaiting {remaining} binary attachment(s)")]
    Incomplete { remaining: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
