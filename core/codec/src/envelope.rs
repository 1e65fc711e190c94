// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed envelope framing shared by all three wire protocols.
//!
//! Every frame is `[1 byte flags][4 bytes big-endian length][payload]`.
//! Bit 0 of the flags marks a compressed payload. The end-of-stream /
//! trailer marker differs by protocol (0x02 for Connect, 0x80 for
//! gRPC-web) and is passed in by the adapters.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;

use crate::compression::Compression;
use crate::errors::CodecError;

/// Flags byte plus the big-endian length word.
pub const ENVELOPE_HEADER_SIZE: usize = 5;

pub mod flags {
    /// Bit 0: the payload is compressed with the negotiated algorithm.
    pub const COMPRESSED: u8 = 0b0000_0001;
    /// Bit 1: Connect end-of-stream frame carrying the JSON trailer.
    pub const END_STREAM: u8 = 0b0000_0010;
    /// Bit 7: gRPC-web trailer frame carrying an HTTP/1-style header block.
    pub const TRAILER: u8 = 0b1000_0000;
}

/// One complete envelope as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopedMessage {
    pub flags: u8,
    pub data: Bytes,
}

impl EnvelopedMessage {
    pub fn new(flags: u8, data: Bytes) -> Self {
        Self { flags, data }
    }

    pub fn is_set(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }
}

/// Serializes an envelope into its 5-byte header plus payload.
pub fn encode_envelope(envelope: &EnvelopedMessage) -> Bytes {
    let mut out = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + envelope.data.len());
    out.put_u8(envelope.flags);
    out.put_u32(envelope.data.len() as u32);
    out.extend_from_slice(&envelope.data);
    out.freeze()
}

/// Parses the 5-byte header. Returns `None` when fewer bytes are available;
/// partial headers are never an error, only an incomplete read.
pub fn parse_envelope_header(buf: &[u8]) -> Option<(u8, u32)> {
    if buf.len() < ENVELOPE_HEADER_SIZE {
        return None;
    }
    let flags = buf[0];
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Some((flags, length))
}

/// Applies the compress-then-frame half of the pipeline: payloads below
/// `compress_min_bytes` are framed as-is even when an algorithm was
/// negotiated.
pub fn frame_message(
    payload: Bytes,
    base_flags: u8,
    compression: Option<Compression>,
    compress_min_bytes: usize,
) -> Result<Bytes, CodecError> {
    let (payload, flags) = match compression {
        Some(algorithm) if payload.len() >= compress_min_bytes => {
            (algorithm.compress(&payload)?, base_flags | flags::COMPRESSED)
        }
        _ => (payload, base_flags),
    };
    Ok(encode_envelope(&EnvelopedMessage::new(flags, payload)))
}

/// Applies the unframe-then-decompress half of the pipeline. A compressed
/// frame without a negotiated algorithm is a protocol violation.
pub fn unframe_message(
    envelope: EnvelopedMessage,
    compression: Option<Compression>,
    read_max_bytes: usize,
) -> Result<Bytes, CodecError> {
    if !envelope.is_set(flags::COMPRESSED) {
        return Ok(envelope.data);
    }
    match compression {
        Some(algorithm) => algorithm.decompress(&envelope.data, read_max_bytes),
        None => Err(CodecError::UnknownCompression),
    }
}

/// Stream adapter that reassembles envelopes from an arbitrary chunking of
/// the underlying byte stream. Partial frames are buffered until enough
/// bytes arrive; they are never dropped.
pub struct EnvelopeReader<S, E> {
    stream: S,
    buffer: BytesMut,
    read_max_bytes: usize,
    finished: bool,
    _marker: std::marker::PhantomData<E>,
}

impl<S, E> EnvelopeReader<S, E> {
    pub fn new(stream: S, read_max_bytes: usize) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            read_max_bytes,
            finished: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Tries to cut one complete envelope off the front of the buffer.
    fn try_parse_envelope(&mut self) -> Result<Option<EnvelopedMessage>, CodecError> {
        let Some((flags, length)) = parse_envelope_header(&self.buffer) else {
            return Ok(None);
        };

        let length = length as usize;
        if length > self.read_max_bytes {
            return Err(CodecError::ReadLimitExceeded {
                size: length,
                limit: self.read_max_bytes,
            });
        }

        let frame_size = ENVELOPE_HEADER_SIZE + length;
        if self.buffer.len() < frame_size {
            return Ok(None);
        }

        let frame = self.buffer.split_to(frame_size);
        let data = Bytes::copy_from_slice(&frame[ENVELOPE_HEADER_SIZE..]);
        Ok(Some(EnvelopedMessage::new(flags, data)))
    }
}

impl<S: Unpin, E> Unpin for EnvelopeReader<S, E> {}

impl<S, E> Stream for EnvelopeReader<S, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: From<CodecError>,
{
    type Item = Result<EnvelopedMessage, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            match this.try_parse_envelope() {
                Ok(Some(envelope)) => return Poll::Ready(Some(Ok(envelope))),
                Ok(None) => {}
                Err(e) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
            }

            match Pin::new(&mut this.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    if !this.buffer.is_empty() {
                        let leftover = this.buffer.len();
                        return Poll::Ready(Some(Err(CodecError::MalformedFrame(format!(
                            "stream ended with {} bytes of incomplete frame",
                            leftover
                        ))
                        .into())));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::{StreamExt, stream};

    fn reader_over(
        chunks: Vec<Bytes>,
        read_max_bytes: usize,
    ) -> EnvelopeReader<impl Stream<Item = Result<Bytes, CodecError>> + Unpin, CodecError> {
        EnvelopeReader::new(stream::iter(chunks.into_iter().map(Ok)), read_max_bytes)
    }

    #[test]
    fn test_header_roundtrip() {
        let envelope = EnvelopedMessage::new(flags::COMPRESSED, Bytes::from_static(b"abc"));
        let encoded = encode_envelope(&envelope);
        assert_eq!(encoded.len(), ENVELOPE_HEADER_SIZE + 3);
        let (parsed_flags, parsed_len) = parse_envelope_header(&encoded).unwrap();
        assert_eq!(parsed_flags, flags::COMPRESSED);
        assert_eq!(parsed_len, 3);
    }

    #[test]
    fn test_partial_header_is_incomplete_not_error() {
        assert!(parse_envelope_header(&[0x00, 0x00]).is_none());
        assert!(parse_envelope_header(&[]).is_none());
    }

    #[test]
    fn test_empty_payload_frame_is_five_bytes() {
        let encoded = encode_envelope(&EnvelopedMessage::new(0, Bytes::new()));
        assert_eq!(encoded.len(), 5);
    }

    #[tokio::test]
    async fn test_split_single_envelope() {
        let encoded = encode_envelope(&EnvelopedMessage::new(0, Bytes::from_static(b"payload")));
        let mut reader = reader_over(vec![encoded], 1024);

        let envelope = reader.next().await.unwrap().unwrap();
        assert_eq!(envelope.flags, 0);
        assert_eq!(&envelope.data[..], b"payload");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_split_across_chunk_boundaries() {
        let first = encode_envelope(&EnvelopedMessage::new(0, Bytes::from_static(b"one")));
        let second = encode_envelope(&EnvelopedMessage::new(0, Bytes::from_static(b"twotwo")));
        let mut all = first.to_vec();
        all.extend_from_slice(&second);

        // Deliberately awkward split points: mid-header and mid-payload.
        let chunks = vec![
            Bytes::copy_from_slice(&all[..2]),
            Bytes::copy_from_slice(&all[2..7]),
            Bytes::copy_from_slice(&all[7..12]),
            Bytes::copy_from_slice(&all[12..]),
        ];
        let mut reader = reader_over(chunks, 1024);

        assert_eq!(&reader.next().await.unwrap().unwrap().data[..], b"one");
        assert_eq!(&reader.next().await.unwrap().unwrap().data[..], b"twotwo");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_byte_payload_roundtrip() {
        let encoded = encode_envelope(&EnvelopedMessage::new(flags::END_STREAM, Bytes::new()));
        let mut reader = reader_over(vec![encoded], 1024);

        let envelope = reader.next().await.unwrap().unwrap();
        assert!(envelope.is_set(flags::END_STREAM));
        assert!(envelope.data.is_empty());
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_fails_before_payload() {
        // Header declares 1 MiB but only the header is ever delivered: the
        // limit check must fire without the payload being materialized.
        let mut header = BytesMut::new();
        header.put_u8(0);
        header.put_u32(1024 * 1024);
        let mut reader = reader_over(vec![header.freeze()], 1024);

        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(err, CodecError::ReadLimitExceeded { limit: 1024, .. }));
    }

    #[tokio::test]
    async fn test_truncated_stream_reports_incomplete_frame() {
        let encoded = encode_envelope(&EnvelopedMessage::new(0, Bytes::from_static(b"full")));
        let truncated = Bytes::copy_from_slice(&encoded[..encoded.len() - 1]);
        let mut reader = reader_over(vec![truncated], 1024);

        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame(_)));
    }

    #[test]
    fn test_frame_skips_compression_below_threshold() {
        let framed = frame_message(
            Bytes::from_static(b"tiny"),
            0,
            Some(Compression::Gzip),
            1024,
        )
        .unwrap();
        let (frame_flags, len) = parse_envelope_header(&framed).unwrap();
        assert_eq!(frame_flags & flags::COMPRESSED, 0);
        assert_eq!(len, 4);
    }

    #[test]
    fn test_frame_compresses_at_threshold() {
        let payload = Bytes::from(vec![b'a'; 2048]);
        let framed = frame_message(payload.clone(), 0, Some(Compression::Gzip), 1024).unwrap();
        let (frame_flags, _) = parse_envelope_header(&framed).unwrap();
        assert_eq!(frame_flags & flags::COMPRESSED, flags::COMPRESSED);

        let envelope = EnvelopedMessage::new(
            frame_flags,
            Bytes::copy_from_slice(&framed[ENVELOPE_HEADER_SIZE..]),
        );
        let restored = unframe_message(envelope, Some(Compression::Gzip), 1 << 20).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_unframe_compressed_without_negotiation() {
        let envelope = EnvelopedMessage::new(flags::COMPRESSED, Bytes::from_static(b"x"));
        let err = unframe_message(envelope, None, 1024).unwrap_err();
        assert!(matches!(err, CodecError::UnknownCompression));
    }
}
