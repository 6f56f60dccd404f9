//! Line-framed codec for child process communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization: one JSON
//! object per `\n`-terminated line. Works over any AsyncRead/AsyncWrite.
//!
//! Decoding only fails on I/O errors and overlong lines.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Longest line accepted from or sent to the child.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Codec that frames messages as lines and serializes with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization. Blank lines and
/// lines that do not decode as `T` are skipped.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            _phantom: PhantomData,
        }
    }

    pub fn max_length(&self) -> usize {
        self.inner.max_length()
    }
}

fn into_io_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Children often print diagnostics to stdout; a line that is not a
/// protocol message is logged and skipped rather than ending the stream.
fn parse_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    tracing::trace!(line_bytes = line.len(), "Decoding line");
    match serde_json::from_str(line) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::info!(error = %e, %line, "Skipping non-protocol line");
            None
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode(src).map_err(into_io_error)? {
            if let Some(item) = parse_line(&line) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode_eof(src).map_err(into_io_error)? {
            if let Some(item) = parse_line(&line) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding line");
        if json_len > 1_000_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large line being encoded"
            );
        }
        self.inner.encode(json, dst).map_err(into_io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{InboundMessage, OutboundMessage, ShutdownReason};

    #[test]
    fn encode_writes_one_line() {
        let mut codec = JsonLinesCodec::<OutboundMessage>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                OutboundMessage::Shutdown {
                    reason: ShutdownReason::ShardEnd,
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            &buf[..],
            b"{\"action\":\"shutdown\",\"reason\":\"SHARD_END\"}\n"
        );
    }

    #[test]
    fn decode_waits_for_newline() {
        let mut codec = JsonLinesCodec::<InboundMessage>::new();
        let mut buf = BytesMut::from(&b"{\"action\":\"status\",\"responseFor\":\"shut"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"down\"}\n");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            InboundMessage::Status {
                response_for: Some("shutdown".to_string())
            }
        );
    }

    #[test]
    fn decode_skips_blank_lines() {
        let mut codec = JsonLinesCodec::<InboundMessage>::new();
        let mut buf = BytesMut::from(&b"\n  \r\n{\"action\":\"status\",\"responseFor\":\"initialize\"}\n"[..]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, InboundMessage::Status { .. }));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_eof_accepts_unterminated_line() {
        let mut codec = JsonLinesCodec::<InboundMessage>::new();
        let mut buf = BytesMut::from(&b"{\"action\":\"status\",\"responseFor\":\"initialize\"}"[..]);

        let decoded = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, InboundMessage::Status { .. }));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_skips_non_json_lines() {
        let mut codec = JsonLinesCodec::<InboundMessage>::new();
        let mut buf = BytesMut::from(&b"Traceback (most recent call last):\n"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"{\"responseFor\":\"initialize\"}\n");
        buf.extend_from_slice(b"{\"action\":\"status\",\"responseFor\":\"initialize\"}\n");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            InboundMessage::Status {
                response_for: Some("initialize".to_string())
            }
        );
    }

    #[test]
    fn decode_eof_skips_trailing_garbage() {
        let mut codec = JsonLinesCodec::<InboundMessage>::new();
        let mut buf = BytesMut::from(&b"loading model..."[..]);

        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_overlong_line() {
        let mut codec = JsonLinesCodec::<InboundMessage>::with_max_length(16);
        let mut buf = BytesMut::from(&b"{\"action\":\"status\",\"responseFor\":\"initialize\"}\n"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(codec.max_length(), 16);
    }
}
