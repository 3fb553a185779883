use std::time::Duration;

use nspmux_codec::CodecConfig;

/// Default cap on namespace CONNECTs buffered while `/` is still pending.
pub const DEFAULT_MAX_CONNECT_BUFFER: usize = 64;

/// Server-wide behavior shared by every connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Decoder limits applied to each connection.
    pub codec: CodecConfig,
    /// Expire acknowledgements that stay unanswered this long.
    /// `None` keeps them until the socket disconnects.
    pub ack_timeout: Option<Duration>,
    /// Namespace CONNECTs a client may queue before `/` is admitted.
    pub max_connect_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            ack_timeout: None,
            max_connect_buffer: DEFAULT_MAX_CONNECT_BUFFER,
        }
    }
}
