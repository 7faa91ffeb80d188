//! Wire frame encoding.
//!
//! Every frame has the layout below. All integers are unsigned big-endian.
//!
//! ```text
//! +--------+---------+----------------+----------------------------+
//! | len u32| ver u8  | correlation u64| payload                    |
//! +--------+---------+----------------+----------------------------+
//!
//! payload = ctx_len u32, ctx, content_len u32, content,
//!           entry_count u32, { key_len u32, key, value_len u32, value }*
//! ```
//!
//! `len` counts every byte after itself. Metadata entries are written in key
//! order, so encoding is canonical.

use crate::error::{Error, Result};
use crate::message::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};

/// Version tag written into every frame.
pub const VERSION: u8 = 1;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the version tag plus correlation id.
pub const HEADER_SIZE: usize = 1 + 8;

/// Default maximum frame size (10MB), excluding the length prefix.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const UNSUPPORTED_VERSION: &str = "unsupported version";
const MALFORMED_FRAME: &str = "malformed frame";

/// A message tagged with its correlation id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Correlation id pairing a request with its response.
    pub correlation_id: u64,
    /// The carried message.
    pub message: Message,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub const fn new(correlation_id: u64, message: Message) -> Self {
        Self {
            correlation_id,
            message,
        }
    }
}

/// Encode a message into a complete frame.
///
/// # Errors
///
/// Returns a validation error if a length does not fit its field.
pub fn encode(message: &Message, correlation_id: u64) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + HEADER_SIZE + payload_len(message));
    encode_into(message, correlation_id, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a complete frame, including its length prefix.
///
/// # Errors
///
/// Returns a protocol error if the version is unknown or the frame is
/// truncated or malformed.
pub fn decode(frame: &[u8]) -> Result<(u64, Message)> {
    let mut buf = frame;
    let correlation_id = get_header(&mut buf)?;
    let message = get_payload(&mut buf)?;
    if buf.has_remaining() {
        return Err(Error::protocol(MALFORMED_FRAME));
    }
    Ok((correlation_id, message))
}

/// Read only the correlation id of a complete frame.
///
/// Succeeds whenever the length prefix and version are sound, even if the
/// payload behind them is not.
///
/// # Errors
///
/// Returns a protocol error if the version is unknown or the header is
/// truncated.
pub fn decode_header(frame: &[u8]) -> Result<u64> {
    let mut buf = frame;
    get_header(&mut buf)
}

fn get_header(buf: &mut &[u8]) -> Result<u64> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() != len || !buf.has_remaining() {
        return Err(Error::protocol(MALFORMED_FRAME));
    }
    if buf.get_u8() != VERSION {
        return Err(Error::protocol(UNSUPPORTED_VERSION));
    }
    if buf.remaining() < 8 {
        return Err(Error::protocol(MALFORMED_FRAME));
    }
    Ok(buf.get_u64())
}

/// Encode just the message payload, without length, version or id.
///
/// # Errors
///
/// Returns a validation error if a length does not fit its field.
pub fn encode_payload(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(payload_len(message));
    put_payload(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a payload produced by [`encode_payload`].
///
/// # Errors
///
/// Returns a protocol error if the payload is truncated or malformed.
pub fn decode_payload(bytes: &[u8]) -> Result<Message> {
    let mut buf = bytes;
    let message = get_payload(&mut buf)?;
    if buf.has_remaining() {
        return Err(Error::protocol(MALFORMED_FRAME));
    }
    Ok(message)
}

/// Number of bytes the frame for `message` occupies after the length prefix.
#[must_use]
pub fn frame_len(message: &Message) -> usize {
    HEADER_SIZE + payload_len(message)
}

fn payload_len(message: &Message) -> usize {
    let entries: usize = message
        .metadata()
        .iter()
        .map(|(key, value)| 8 + key.len() + value.len())
        .sum();
    4 + message.context().len() + 4 + message.content().len() + 4 + entries
}

fn encode_into(message: &Message, correlation_id: u64, buf: &mut BytesMut) -> Result<()> {
    put_len(buf, frame_len(message))?;
    buf.put_u8(VERSION);
    buf.put_u64(correlation_id);
    put_payload(message, buf)
}

fn put_payload(message: &Message, buf: &mut BytesMut) -> Result<()> {
    put_bytes(buf, message.context().as_bytes())?;
    put_bytes(buf, message.content())?;
    put_len(buf, message.metadata().len())?;
    for (key, value) in message.metadata() {
        put_bytes(buf, key.as_bytes())?;
        put_bytes(buf, value.as_bytes())?;
    }
    Ok(())
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| Error::validation(format!("length {len} exceeds {}", u32::MAX)))?;
    buf.put_u32(len);
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    put_len(buf, bytes.len())?;
    buf.put_slice(bytes);
    Ok(())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::protocol(MALFORMED_FRAME));
    }
    Ok(buf.get_u32())
}

fn get_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::protocol(MALFORMED_FRAME));
    }
    let slice: &'a [u8] = *buf;
    let (bytes, rest) = slice.split_at(len);
    *buf = rest;
    Ok(bytes)
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::protocol(MALFORMED_FRAME))
}

fn get_payload(buf: &mut &[u8]) -> Result<Message> {
    let context = get_string(buf)?;
    let content = Bytes::copy_from_slice(get_bytes(buf)?);
    let count = get_u32(buf)?;

    let mut metadata = BTreeMap::new();
    for _ in 0..count {
        let key = get_string(buf)?;
        let value = get_string(buf)?;
        if metadata.insert(key, value).is_some() {
            return Err(Error::protocol(MALFORMED_FRAME));
        }
    }

    let mut message = Message::new(context).with_content(content);
    for (key, value) in metadata {
        message.insert_metadata(key, value);
    }
    Ok(message)
}

/// Splits a byte stream into frames and encodes outgoing frames.
///
/// Decoded items are complete raw frames, length prefix included. Parsing is
/// left to [`decode`] so that a single malformed frame can be dealt with
/// without losing the stream position.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// The maximum frame size this codec accepts.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame into a standalone buffer.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the frame exceeds the maximum size.
    pub fn encode_frame(&mut self, frame: &Frame) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(frame, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = &buf[..LENGTH_PREFIX_SIZE];
        let len = prefix.get_u32() as usize;

        // A bad length cannot be skipped; the stream is no longer trustworthy
        if len > self.max_frame_size {
            return Err(Error::protocol(format!(
                "frame size {len} exceeds maximum {}",
                self.max_frame_size
            )));
        }

        let frame_len = LENGTH_PREFIX_SIZE + len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        Ok(Some(buf.split_to(frame_len)))
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: &Frame, buf: &mut BytesMut) -> Result<()> {
        let len = frame_len(&frame.message);
        if len > self.max_frame_size {
            return Err(Error::validation(format!(
                "frame size {len} exceeds maximum {}",
                self.max_frame_size
            )));
        }

        buf.reserve(LENGTH_PREFIX_SIZE + len);
        encode_into(&frame.message, frame.correlation_id, buf)
    }
}
