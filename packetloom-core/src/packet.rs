//! The outermost wire record: one per datagram.
use std::io::Read;

use crate::codec::{Decode, Encode, Varint};
use crate::error::Error;
use crate::frame::Frame;

pub const MAX_PACKET_SIZE: usize = 1232;
const HEADER_LEN: usize = 13;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Handshake = 1,
    Stream = 2,
    Terminate = 3,
}

impl PacketType {
    fn from_u8(b: u8) -> Result<Self, Error> {
        Ok(match b {
            1 => Self::Handshake,
            2 => Self::Stream,
            3 => Self::Terminate,
            other => return Err(Error::UnknownPacketType(other)),
        })
    }
}

/// `{type, connection_id, sequence, frame?}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub connection_id: u64,
    pub sequence: u32,
    pub frame: Option<Frame>,
}

impl Packet {
    pub fn new(packet_type: PacketType, connection_id: u64, sequence: u32, frame: Option<Frame>) -> Self {
        Self { packet_type, connection_id, sequence, frame }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        (self.packet_type as u8).encode(&mut buf)?;
        self.connection_id.encode(&mut buf)?;
        self.sequence.encode(&mut buf)?;

        if let Some(frame) = &self.frame {
            let body = frame.encode_packet_body()?;
            (frame.frame_type() as u8).encode(&mut buf)?;
            Varint(body.len() as u64).encode(&mut buf)?;
            buf.extend_from_slice(&body);
        }

        if buf.len() > MAX_PACKET_SIZE {
            return Err(Error::OversizeFrame(buf.len()));
        }

        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() > MAX_PACKET_SIZE {
            return Err(Error::OversizeFrame(buf.len()));
        }

        let mut reader = buf;

        let mut type_byte = [0u8; 1];
        reader.read_exact(&mut type_byte).map_err(|_| Error::ShortBuffer)?;
        let packet_type = PacketType::from_u8(type_byte[0])?;

        let connection_id = u64::decode(&mut reader).map_err(|_| Error::ShortBuffer)?;
        let sequence = u32::decode(&mut reader).map_err(|_| Error::ShortBuffer)?;

        if reader.is_empty() {
            return Ok(Self { packet_type, connection_id, sequence, frame: None });
        }

        let mut frame_type = [0u8; 1];
        reader.read_exact(&mut frame_type).map_err(|_| Error::ShortBuffer)?;

        let frame_body_len = Varint::decode(&mut reader)?.0 as usize;
        if frame_body_len > MAX_PACKET_SIZE {
            return Err(Error::OversizeFrame(frame_body_len));
        }
        if reader.len() < frame_body_len {
            return Err(Error::ShortBuffer);
        }

        let (body, _) = reader.split_at(frame_body_len);
        let frame = Frame::decode_packet_body(frame_type[0], body)?;

        Ok(Self { packet_type, connection_id, sequence, frame: Some(frame) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use crate::frame::Handshake;

    #[test]
    fn test_terminate_packet_roundtrip() {
        let packet = Packet::new(PacketType::Terminate, 42, 7, None);
        let buf = packet.encode().unwrap();
        assert_eq!(buf.len(), HEADER_LEN);

        let decoded = Packet::decode(&buf).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_stream_control_packet_roundtrip() {
        let frame = Frame::StreamOpen { stream_id: 9 };
        let packet = Packet::new(PacketType::Stream, 1, 1, Some(frame));
        let buf = packet.encode().unwrap();

        let decoded = Packet::decode(&buf).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_handshake_packet_roundtrip_and_padding() {
        let handshake = Handshake::new(2048, [1u8; KEY_LEN]);
        let frame = Frame::Handshake(handshake);
        let packet = Packet::new(PacketType::Handshake, 0, 0, Some(frame));

        let buf = packet.encode().unwrap();
        assert_eq!(buf.len(), MAX_PACKET_SIZE);

        let decoded = Packet::decode(&buf).unwrap();
        match decoded.frame {
            Some(Frame::Handshake(h)) => {
                assert_eq!(h.buffer_size, 2048);
                assert!(h.max_frame_size.unwrap() > 0);
            }
            _ => panic!("expected handshake frame"),
        }
    }

    #[test]
    fn test_oversize_frame_body_rejected() {
        let mut buf = Vec::new();
        (PacketType::Stream as u8).encode(&mut buf).unwrap();
        1u64.encode(&mut buf).unwrap();
        1u32.encode(&mut buf).unwrap();
        (crate::frame::FrameType::StreamData as u8).encode(&mut buf).unwrap();
        Varint((MAX_PACKET_SIZE + 1) as u64).encode(&mut buf).unwrap();

        let err = Packet::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::OversizeFrame(_)));
    }

    #[test]
    fn test_truncated_packet_is_short_buffer() {
        let buf = [1u8, 2, 3];
        let err = Packet::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::ShortBuffer));
    }
}
