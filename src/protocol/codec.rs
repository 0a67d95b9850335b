//! Frame codec
//!
//! Wire layout:
//!
//! ```text
//! +----------------+---------+---------------------+
//! | length (u32 BE)| type u8 | body (length-1)     |
//! +----------------+---------+---------------------+
//! ```
//!
//! Strings inside a body are UTF-8 with a 16-bit big-endian length prefix.
//! Event bodies start with an `i64` millisecond timestamp and a kind byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::DateTime;
use tokio_util::codec::{Decoder, Encoder};

use super::constants::*;
use super::message::{Event, EventKind, Frame, Metadata};
use crate::error::{Code, Error, ProtocolError, Status};

/// Length-prefixed frame codec used on both ends of a connection
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default frame size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            }
            .into());
        }

        if src.len() < FRAME_HEADER_SIZE + len {
            src.reserve(FRAME_HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let mut payload = src.split_to(len).freeze();
        decode_frame(&mut payload).map(Some).map_err(Error::from)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let mut body = BytesMut::new();
        encode_frame(&frame, &mut body)?;

        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            }
            .into());
        }

        dst.reserve(FRAME_HEADER_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

fn decode_frame(buf: &mut Bytes) -> Result<Frame, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::Truncated("frame type"));
    }

    let frame = match buf.get_u8() {
        FRAME_LOGIN => Frame::Login {
            name: read_string(buf, "login name")?,
        },
        FRAME_LOGOUT => Frame::Logout {
            token: read_string(buf, "logout token")?,
        },
        FRAME_STREAM => Frame::Stream {
            metadata: read_metadata(buf)?,
        },
        FRAME_MESSAGE => Frame::Message {
            text: read_string(buf, "message text")?,
        },
        FRAME_LOGIN_OK => Frame::LoginOk {
            token: read_string(buf, "login token")?,
        },
        FRAME_LOGOUT_OK => Frame::LogoutOk,
        FRAME_STREAM_ACCEPTED => Frame::StreamAccepted,
        FRAME_EVENT => Frame::Event(read_event(buf)?),
        FRAME_STATUS => {
            if !buf.has_remaining() {
                return Err(ProtocolError::Truncated("status code"));
            }
            let code = Code::from_u8(buf.get_u8())?;
            let message = read_string(buf, "status message")?;
            Frame::Status(Status::new(code, message))
        }
        other => return Err(ProtocolError::UnknownFrameType(other)),
    };

    Ok(frame)
}

fn encode_frame(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    match frame {
        Frame::Login { name } => {
            buf.put_u8(FRAME_LOGIN);
            write_string(buf, name)?;
        }
        Frame::Logout { token } => {
            buf.put_u8(FRAME_LOGOUT);
            write_string(buf, token)?;
        }
        Frame::Stream { metadata } => {
            buf.put_u8(FRAME_STREAM);
            write_metadata(buf, metadata)?;
        }
        Frame::Message { text } => {
            buf.put_u8(FRAME_MESSAGE);
            write_string(buf, text)?;
        }
        Frame::LoginOk { token } => {
            buf.put_u8(FRAME_LOGIN_OK);
            write_string(buf, token)?;
        }
        Frame::LogoutOk => buf.put_u8(FRAME_LOGOUT_OK),
        Frame::StreamAccepted => buf.put_u8(FRAME_STREAM_ACCEPTED),
        Frame::Event(event) => {
            buf.put_u8(FRAME_EVENT);
            write_event(buf, event)?;
        }
        Frame::Status(status) => {
            buf.put_u8(FRAME_STATUS);
            buf.put_u8(status.code.as_u8());
            write_string(buf, &status.message)?;
        }
    }

    Ok(())
}

fn read_event(buf: &mut Bytes) -> Result<Event, ProtocolError> {
    if buf.remaining() < 9 {
        return Err(ProtocolError::Truncated("event header"));
    }

    let millis = buf.get_i64();
    let timestamp =
        DateTime::from_timestamp_millis(millis).ok_or(ProtocolError::InvalidTimestamp(millis))?;

    let kind = match buf.get_u8() {
        EVENT_JOINED => EventKind::Joined {
            name: read_string(buf, "event name")?,
        },
        EVENT_LEFT => EventKind::Left {
            name: read_string(buf, "event name")?,
        },
        EVENT_MESSAGE => EventKind::Message {
            name: read_string(buf, "event name")?,
            text: read_string(buf, "event text")?,
        },
        EVENT_SHUTTING_DOWN => EventKind::ShuttingDown,
        other => return Err(ProtocolError::UnknownEventKind(other)),
    };

    Ok(Event { timestamp, kind })
}

fn write_event(buf: &mut BytesMut, event: &Event) -> Result<(), ProtocolError> {
    buf.put_i64(event.timestamp.timestamp_millis());

    match &event.kind {
        EventKind::Joined { name } => {
            buf.put_u8(EVENT_JOINED);
            write_string(buf, name)?;
        }
        EventKind::Left { name } => {
            buf.put_u8(EVENT_LEFT);
            write_string(buf, name)?;
        }
        EventKind::Message { name, text } => {
            buf.put_u8(EVENT_MESSAGE);
            write_string(buf, name)?;
            write_string(buf, text)?;
        }
        EventKind::ShuttingDown => buf.put_u8(EVENT_SHUTTING_DOWN),
    }

    Ok(())
}

fn read_metadata(buf: &mut Bytes) -> Result<Metadata, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated("metadata count"));
    }

    let count = buf.get_u16();
    let mut metadata = Metadata::new();
    for _ in 0..count {
        let key = read_string(buf, "metadata key")?;
        let value = read_string(buf, "metadata value")?;
        metadata.insert(key, value);
    }

    Ok(metadata)
}

fn write_metadata(buf: &mut BytesMut, metadata: &Metadata) -> Result<(), ProtocolError> {
    let count =
        u16::try_from(metadata.len()).map_err(|_| ProtocolError::StringTooLong(metadata.len()))?;
    buf.put_u16(count);
    for (key, value) in metadata.iter() {
        write_string(buf, key)?;
        write_string(buf, value)?;
    }
    Ok(())
}

/// Read UTF-8 string with 16-bit length prefix
fn read_string(buf: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated(field));
    }

    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated(field));
    }

    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

/// Write UTF-8 string with 16-bit length prefix
fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    if s.len() > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong(s.len()));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Longest name whose message events still fit in a frame
///
/// A name this long leaves room for a message event with empty text, so its
/// presence events fit as well.
pub fn max_name_len(max_frame_size: usize) -> usize {
    max_frame_size
        .saturating_sub(EVENT_HEADER_SIZE + 2 * STRING_HEADER_SIZE)
        .min(MAX_STRING_LEN)
}

/// Longest message text `name` can send that still fits in a broadcast
/// event frame
pub fn max_message_len(max_frame_size: usize, name: &str) -> usize {
    max_frame_size
        .saturating_sub(EVENT_HEADER_SIZE + 2 * STRING_HEADER_SIZE + name.len())
        .min(MAX_STRING_LEN)
}
