use rpc_tester_codec::{CodecError, FrameKind};

/// Failure of a call or of the connection carrying it. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("No handler registered for verb {0}")]
    UnknownVerb(i32),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Unexpected {kind:?} frame for verb {verb}")]
    UnexpectedFrame { kind: FrameKind, verb: i32 },
}
