/// Default maximum number of binary attachments per packet.
pub const DEFAULT_MAX_ATTACHMENTS: usize = 64;

/// Default maximum frame size: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Limits applied by the packet decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Maximum binary attachments a single packet may declare.
    pub max_attachments: usize,
    /// Maximum size of any single frame (text or binary) in bytes.
    pub max_frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_attachments: DEFAULT_MAX_ATTACHMENTS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
