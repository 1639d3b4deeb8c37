use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::wire::{encode_payload, WireDecode, WireEncode};
use crate::CodecError;

/// kind (u8) + verb (i32) + message id (u64) + payload length (u32)
pub const FRAME_HEADER_LEN: usize = 1 + 4 + 8 + 4;

pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    /// A failed request. The payload is an encoded error message.
    Error = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::Error),
            other => Err(CodecError::UnknownFrameKind(other)),
        }
    }
}

/// One message on a connection. Responses and errors carry the id of the request they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub verb: i32,
    pub id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(verb: i32, id: u64, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Request,
            verb,
            id,
            payload,
        }
    }

    pub fn response(verb: i32, id: u64, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Response,
            verb,
            id,
            payload,
        }
    }

    pub fn error(verb: i32, id: u64, message: &str) -> Self {
        Self {
            kind: FrameKind::Error,
            verb,
            id,
            payload: encode_payload(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameCodec {
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(u32::MAX as usize),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < FRAME_HEADER_LEN {
            src.reserve(FRAME_HEADER_LEN - src.len());
            return Ok(None);
        }

        let mut header = &src[..FRAME_HEADER_LEN];
        let kind = FrameKind::try_from(u8::decode(&mut header)?)?;
        let verb = i32::decode(&mut header)?;
        let id = u64::decode(&mut header)?;
        let len = u32::decode(&mut header)? as usize;

        if len > self.max_payload {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }

        let frame_len = FRAME_HEADER_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame {
            kind,
            verb,
            id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = frame.payload.len();
        if len > self.max_payload {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + len);
        (frame.kind as u8).encode(dst);
        frame.verb.encode(dst);
        frame.id.encode(dst);
        (len as u32).encode(dst);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
