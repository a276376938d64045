//! Failure taxonomy for the streaming pipeline.
//!
//! Nothing here is fatal. Source, encode and transport failures skip the
//! current cycle and the pipeline recovers on the next ready token or
//! reconnect; only precondition violations are returned to the caller.

use thiserror::Error;

/// Compositing refused because a canvas has no area
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("source has degenerate dimensions {width}x{height}")]
    DegenerateSource { width: u32, height: u32 },
    #[error("target canvas has degenerate dimensions {width}x{height}")]
    DegenerateTarget { width: u32, height: u32 },
}

/// The codec produced nothing usable for this frame
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("codec produced no output")]
    EmptyOutput,
    #[error("codec failed: {0}")]
    Codec(#[from] image::ImageError),
    #[error("encode task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The source cannot deliver a frame right now
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source is paused")]
    Paused,
    #[error("source has ended")]
    Ended,
    #[error("source reports zero dimensions")]
    NoDimensions,
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Operation rejected by the streamer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("connection to the receiver is not open")]
    NotConnected,
    #[error("no frame source selected")]
    NoSource,
    #[error("streamer has shut down")]
    Shutdown,
}
