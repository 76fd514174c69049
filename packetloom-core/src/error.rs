use std::io;

/// Errors surfaced by the codec, packet, session, stream and mux layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("buffer too short")]
    ShortBuffer,
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),
    #[error("varint overflow")]
    VarintOverflow,
    #[error("frame exceeds max packet size: {0}")]
    OversizeFrame(usize),
    #[error("aead authentication failed")]
    CryptoFailure,
    #[error("message too large for buffer")]
    TooLarge,
    #[error("invalid handshake: buffer_size must be > 0")]
    InvalidHandshake,

    #[error("mux is closed")]
    MuxClosed,
    #[error("session is closed")]
    SessionClosed,
    #[error("stream is closed")]
    StreamClosed,
    #[error("stream was already closed")]
    AlreadyClosed,
    #[error("operation interrupted by shutdown")]
    Interrupted,
    #[error("remote reset the stream")]
    StreamReset,
    #[error("all stream ids have been allocated")]
    StreamsExhausted,
    #[error("sequence counter would wrap, terminating session to avoid nonce reuse")]
    SequenceExhausted,

    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
