//! Length delimited framing of mesh entries.
//!
//! Every frame is a protobuf style varint holding the payload length,
//! followed by the JSON encoding of one [`MeshEntry`].  Frames are simply
//! concatenated, so a single broadcast and a full state dump share the
//! same format.

use bytes::Bytes;
use log::warn;

use crate::types::MeshEntry;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed length prefix: {0}")]
    Prefix(#[from] prost::DecodeError),
    #[error("write length prefix: {0}")]
    Capacity(#[from] prost::EncodeError),
    #[error("frame announces {expected} bytes but only {available} remain")]
    TruncatedPayload { expected: usize, available: usize },
    #[error("malformed entry: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Splits the next frame off `buf`, returning the payload and the total
/// frame length.
fn frame(buf: &[u8]) -> Result<(&[u8], usize), Error> {
    let mut cursor = buf;
    let len = prost::decode_length_delimiter(&mut cursor)?;
    let prefix = buf.len() - cursor.len();

    if cursor.len() < len {
        return Err(Error::TruncatedPayload {
            expected: len,
            available: cursor.len(),
        });
    }

    Ok((&cursor[..len], prefix + len))
}

/// Appends one frame holding `entry` to `buf`.
pub fn write_delimited(buf: &mut Vec<u8>, entry: &MeshEntry) -> Result<(), Error> {
    let payload = serde_json::to_vec(entry)?;
    buf.reserve(prost::length_delimiter_len(payload.len()) + payload.len());
    prost::encode_length_delimiter(payload.len(), buf)?;
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Encodes a single entry, as handed to the broadcast primitive.
pub fn encode(entry: &MeshEntry) -> Result<Bytes, Error> {
    let mut buf = Vec::new();
    write_delimited(&mut buf, entry)?;
    Ok(buf.into())
}

/// Iterates over the frames of a buffer.
///
/// Iteration stops after the first error, the end of the buffer is the
/// normal end of the stream.
pub struct Decoder<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }

    fn next_frame(&mut self) -> Result<&'a [u8], Error> {
        let (payload, consumed) = frame(self.buf)?;
        self.buf = &self.buf[consumed..];
        Ok(payload)
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<MeshEntry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }

        let result = self.next_frame().and_then(|frame| {
            serde_json::from_slice::<MeshEntry>(frame)
                .map(MeshEntry::normalize)
                .map_err(Error::from)
        });
        if result.is_err() {
            self.failed = true;
        }

        Some(result)
    }
}

/// Groups the frames of `buf` into chunks of at most `max` bytes without
/// splitting a frame.  A frame larger than `max` on its own can never be
/// delivered and is left out.
pub fn split_frames(buf: &[u8], max: usize) -> Result<Vec<Bytes>, Error> {
    let mut chunks = Vec::new();
    let mut chunk = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let (_, len) = frame(&buf[pos..])?;
        let bytes = &buf[pos..pos + len];
        pos += len;

        if len > max {
            warn!("Skip frame of {} bytes, messages are limited to {} bytes", len, max);
            continue;
        }

        if chunk.len() + len > max {
            chunks.push(Bytes::from(std::mem::take(&mut chunk)));
        }
        chunk.extend_from_slice(bytes);
    }

    if !chunk.is_empty() {
        chunks.push(Bytes::from(chunk));
    }

    Ok(chunks)
}
