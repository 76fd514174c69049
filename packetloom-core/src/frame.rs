//! Typed frame variants carried inside a [`Packet`](crate::packet::Packet).
use std::io::{Read, Write};

use crate::codec::{Decode, Encode, Varint};
use crate::crypto::KEY_LEN;
use crate::error::Error;
use crate::packet::MAX_PACKET_SIZE;

/// Frame type tag, the first byte of a frame body.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 1,
    StreamOpen = 2,
    StreamReset = 3,
    StreamDataInit = 4,
    StreamData = 5,
    StreamDataAck = 6,
    StreamClose = 7,
    Crypto = 8,
    /// Acknowledges a `StreamOpen`. Not part of the eight codes enumerated
    /// in the wire-format table; see DESIGN.md.
    StreamAck = 9,
}

impl FrameType {
    fn from_u8(b: u8) -> Result<Self, Error> {
        Ok(match b {
            1 => Self::Handshake,
            2 => Self::StreamOpen,
            3 => Self::StreamReset,
            4 => Self::StreamDataInit,
            5 => Self::StreamData,
            6 => Self::StreamDataAck,
            7 => Self::StreamClose,
            8 => Self::Crypto,
            9 => Self::StreamAck,
            other => return Err(Error::UnknownFrameType(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Handshake(Handshake),
    StreamOpen { stream_id: u32 },
    StreamAck { stream_id: u32 },
    StreamClose { stream_id: u32 },
    StreamReset { stream_id: u32 },
    StreamDataInit { stream_id: u32, total_length: u64 },
    StreamData { stream_id: u32, offset: u32, payload: Vec<u8> },
    StreamDataAck { stream_id: u32, offset: u32 },
    /// An opaque, already-encrypted inner frame (type byte + body).
    Crypto(Vec<u8>),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Handshake(_) => FrameType::Handshake,
            Self::StreamOpen { .. } => FrameType::StreamOpen,
            Self::StreamAck { .. } => FrameType::StreamAck,
            Self::StreamClose { .. } => FrameType::StreamClose,
            Self::StreamReset { .. } => FrameType::StreamReset,
            Self::StreamDataInit { .. } => FrameType::StreamDataInit,
            Self::StreamData { .. } => FrameType::StreamData,
            Self::StreamDataAck { .. } => FrameType::StreamDataAck,
            Self::Crypto(_) => FrameType::Crypto,
        }
    }

    /// Encodes the type byte followed by the body, used both as the plain
    /// on-wire representation and as the plaintext sealed by `Crypto`.
    pub fn encode_tagged(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(self.size_hint() + 1);
        (self.frame_type() as u8).encode(&mut buf)?;
        self.encode_body(&mut buf)?;
        Ok(buf)
    }

    pub fn decode_tagged(buf: &[u8]) -> Result<Self, Error> {
        let mut reader = buf;
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag).map_err(|_| Error::ShortBuffer)?;
        let frame_type = FrameType::from_u8(tag[0])?;
        Self::decode_body(frame_type, reader)
    }

    /// Encodes just the body (no leading type byte), the form a [`Packet`]
    /// writes after its own frame-type byte and varint length. Handshake
    /// bodies are padded to `MAX_PACKET_SIZE` here, since padding is a
    /// property of the enclosing datagram rather than of the frame itself.
    pub(crate) fn encode_packet_body(&self) -> Result<Vec<u8>, Error> {
        if let Self::Handshake(h) = self {
            return h.encode_padded();
        }

        let mut buf = Vec::with_capacity(self.size_hint());
        self.encode_body(&mut buf)?;
        Ok(buf)
    }

    /// Rebuilds a frame from its type byte and a body slice (the inverse of
    /// `encode_packet_body`).
    pub(crate) fn decode_packet_body(frame_type: u8, body: &[u8]) -> Result<Self, Error> {
        let frame_type = FrameType::from_u8(frame_type)?;
        Self::decode_body(frame_type, body)
    }

    fn encode_body<W: Write>(&self, mut writer: W) -> Result<(), Error> {
        match self {
            Self::Handshake(h) => h.encode(&mut writer),
            Self::StreamOpen { stream_id }
            | Self::StreamAck { stream_id }
            | Self::StreamClose { stream_id }
            | Self::StreamReset { stream_id } => {
                stream_id.encode(&mut writer).map_err(Error::from)
            }
            Self::StreamDataInit { stream_id, total_length } => {
                stream_id.encode(&mut writer)?;
                Varint(*total_length).encode(&mut writer)
            }
            Self::StreamData { stream_id, offset, payload } => {
                stream_id.encode(&mut writer)?;
                offset.encode(&mut writer)?;
                payload.as_slice().encode(&mut writer).map_err(Error::from)
            }
            Self::StreamDataAck { stream_id, offset } => {
                stream_id.encode(&mut writer)?;
                offset.encode(&mut writer).map_err(Error::from)
            }
            Self::Crypto(ciphertext) => ciphertext.as_slice().encode(&mut writer).map_err(Error::from),
        }
    }

    fn decode_body<R: Read>(frame_type: FrameType, mut reader: R) -> Result<Self, Error> {
        Ok(match frame_type {
            FrameType::Handshake => Self::Handshake(Handshake::decode(&mut reader)?),
            FrameType::StreamOpen => Self::StreamOpen {
                stream_id: u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?,
            },
            FrameType::StreamAck => Self::StreamAck {
                stream_id: u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?,
            },
            FrameType::StreamClose => Self::StreamClose {
                stream_id: u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?,
            },
            FrameType::StreamReset => Self::StreamReset {
                stream_id: u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?,
            },
            FrameType::StreamDataInit => {
                let stream_id = u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?;
                let total_length = Varint::decode(&mut reader)?.0;
                Self::StreamDataInit { stream_id, total_length }
            }
            FrameType::StreamData => {
                let stream_id = u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?;
                let offset = u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?;
                let mut payload = Vec::new();
                reader.read_to_end(&mut payload).map_err(|_| Error::ShortBuffer)?;
                Self::StreamData { stream_id, offset, payload }
            }
            FrameType::StreamDataAck => {
                let stream_id = u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?;
                let offset = u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?;
                Self::StreamDataAck { stream_id, offset }
            }
            FrameType::Crypto => {
                let mut ciphertext = Vec::new();
                reader.read_to_end(&mut ciphertext).map_err(|_| Error::ShortBuffer)?;
                Self::Crypto(ciphertext)
            }
        })
    }

    fn size_hint(&self) -> usize {
        match self {
            Self::Handshake(h) => h.size_hint(),
            Self::StreamOpen { .. }
            | Self::StreamAck { .. }
            | Self::StreamClose { .. }
            | Self::StreamReset { .. } => 4,
            Self::StreamDataInit { .. } => 4 + 8,
            Self::StreamData { payload, .. } => 4 + 4 + payload.len(),
            Self::StreamDataAck { .. } => 8,
            Self::Crypto(ciphertext) => ciphertext.len(),
        }
    }
}

/// `{buffer_size, public_key, padding}`. `max_frame_size` is populated only
/// on decode, from the observed residual padding length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub buffer_size: u64,
    pub public_key: [u8; KEY_LEN],
    pub max_frame_size: Option<usize>,
}

impl Handshake {
    pub fn new(buffer_size: u64, public_key: [u8; KEY_LEN]) -> Self {
        Self { buffer_size, public_key, max_frame_size: None }
    }

    fn fixed_body_len(&self) -> usize {
        Varint(self.buffer_size).size_hint() + KEY_LEN
    }

    fn encode(&self, writer: &mut impl Write) -> Result<(), Error> {
        Varint(self.buffer_size).encode(&mut *writer)?;
        writer.write_all(&self.public_key).map_err(Error::from)
    }

    fn size_hint(&self) -> usize {
        self.fixed_body_len()
    }

    fn decode(mut reader: impl Read) -> Result<Self, Error> {
        let buffer_size = Varint::decode(&mut reader)?.0;
        if buffer_size == 0 {
            return Err(Error::InvalidHandshake);
        }

        let mut public_key = [0u8; KEY_LEN];
        reader.read_exact(&mut public_key).map_err(|_| Error::ShortBuffer)?;

        let mut padding = Vec::new();
        reader.read_to_end(&mut padding).map_err(|_| Error::ShortBuffer)?;

        Ok(Self {
            buffer_size,
            public_key,
            max_frame_size: Some(padding.len()),
        })
    }

    /// Computes the padding length that makes the full packet (13-byte
    /// header ‖ frame_type ‖ varint length ‖ body) exactly
    /// `MAX_PACKET_SIZE` bytes, solving the circular dependency between the
    /// varint length's own width and the padded body length it describes.
    pub fn padding_len(&self) -> Result<usize, Error> {
        const HEADER_LEN: usize = 13;
        const FRAME_TYPE_LEN: usize = 1;

        let fixed = self.fixed_body_len();
        let prefix = HEADER_LEN + FRAME_TYPE_LEN;

        for width in [1usize, 2, 4, 8] {
            if prefix + width > MAX_PACKET_SIZE {
                continue;
            }
            let candidate_body_len = MAX_PACKET_SIZE - prefix - width;
            if candidate_body_len < fixed {
                continue;
            }
            if Varint::encoded_len(candidate_body_len as u64) == width {
                return Ok(candidate_body_len - fixed);
            }
        }

        Err(Error::OversizeFrame(fixed))
    }

    /// Encodes this handshake padded out to `MAX_PACKET_SIZE` when framed
    /// inside a packet. Used by `Packet::encode` rather than `Frame::encode`
    /// directly, since padding is a property of the enclosing datagram.
    pub fn encode_padded(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(self.fixed_body_len());
        self.encode(&mut buf)?;
        buf.resize(buf.len() + self.padding_len()?, 0);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_roundtrip() {
        let frame = Frame::StreamOpen { stream_id: 7 };
        let buf = frame.encode_tagged().unwrap();
        let decoded = Frame::decode_tagged(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_stream_data_roundtrip() {
        let frame = Frame::StreamData {
            stream_id: 3,
            offset: 1000,
            payload: vec![1, 2, 3, 4, 5],
        };
        let buf = frame.encode_tagged().unwrap();
        let decoded = Frame::decode_tagged(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_stream_data_init_roundtrip() {
        let frame = Frame::StreamDataInit { stream_id: 1, total_length: 4000 };
        let buf = frame.encode_tagged().unwrap();
        let decoded = Frame::decode_tagged(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unknown_frame_type_errors() {
        let buf = [0xFFu8];
        let err = Frame::decode_tagged(&buf).unwrap_err();
        assert!(matches!(err, Error::UnknownFrameType(0xFF)));
    }

    #[test]
    fn test_handshake_padding_fills_max_packet_size() {
        let handshake = Handshake::new(1024, [9u8; KEY_LEN]);
        let padded = handshake.encode_padded().unwrap();

        // header(13) + frame_type(1) + varint-len prefix + padded body
        let varint_len = Varint(padded.len() as u64).size_hint();
        assert_eq!(13 + 1 + varint_len + padded.len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn test_handshake_decode_recovers_max_frame_size() {
        let handshake = Handshake::new(1024, [5u8; KEY_LEN]);
        let padded = handshake.encode_padded().unwrap();

        let decoded = Handshake::decode(&padded[..]).unwrap();
        assert_eq!(decoded.buffer_size, 1024);
        assert_eq!(decoded.public_key, [5u8; KEY_LEN]);
        assert!(decoded.max_frame_size.unwrap() > 0);
    }

    #[test]
    fn test_handshake_rejects_zero_buffer_size() {
        let mut buf = Vec::new();
        Varint(0).encode(&mut buf).unwrap();
        buf.extend_from_slice(&[0u8; KEY_LEN]);

        let err = Handshake::decode(&buf[..]).unwrap_err();
        assert!(matches!(err, Error::InvalidHandshake));
    }
}
