mod frame;
mod wire;

pub use frame::{Frame, FrameCodec, FrameKind, DEFAULT_MAX_PAYLOAD, FRAME_HEADER_LEN};
pub use wire::{decode_payload, encode_payload, WireDecode, WireEncode};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Truncated input, needed {needed} bytes but only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },
    #[error("String is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("Found {0} unexpected bytes after the payload")]
    TrailingBytes(usize),
    #[error("Frame payload of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Unknown frame kind {0}")]
    UnknownFrameKind(u8),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
