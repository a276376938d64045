//! Flow-controlled JPEG streaming to small embedded displays.
//!
//! A [`streamer::Streamer`] captures one frame from a [`source::FrameSource`]
//! each time the receiver sends a ready token, fits it onto the receiver's
//! canvas, compresses it and sends it over a WebSocket that reconnects on its
//! own.

pub mod cli;
pub mod compose;
pub mod encode;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod source;
pub mod streamer;
pub mod telemetry;
pub mod transport;
