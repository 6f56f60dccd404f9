//! IPC bridge between the parent and a child record processor.
//!
//! # Architecture
//!
//! - **protocol**: Message types (OutboundMessage, InboundMessage) and round inputs
//! - **codec**: JSON-lines framing codec for AsyncRead/AsyncWrite
//! - **transport**: Reader/writer seams the session drives

pub mod codec;
pub mod protocol;
pub mod transport;
