use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, SbdError};

/// Envelope version understood by this codec.
pub const PROTOCOL_VERSION: u32 = 1;

/// version + operation + sequence + length
pub const HEADER_LEN: usize = 16;

/// Upper bound on a single payload.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// One framed message: header fields plus the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u32,
    pub operation: i32,
    pub sequence: i32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(operation: i32, sequence: i32, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            operation,
            sequence,
            payload,
        }
    }
}

/// Length-prefixed binary envelope around JSON payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = SbdError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let version = header.get_u32();
        let operation = header.get_i32();
        let sequence = header.get_i32();
        let length = header.get_u32() as usize;

        if version != PROTOCOL_VERSION {
            return Err(SbdError::Protocol(format!(
                "unsupported envelope version {}",
                version
            )));
        }
        if length > MAX_PAYLOAD_LEN {
            return Err(SbdError::Protocol(format!(
                "payload of {} bytes exceeds limit",
                length
            )));
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        Ok(Some(Packet {
            version,
            operation,
            sequence,
            payload,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = SbdError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > MAX_PAYLOAD_LEN {
            return Err(SbdError::Protocol(format!(
                "payload of {} bytes exceeds limit",
                item.payload.len()
            )));
        }

        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32(item.version);
        dst.put_i32(item.operation);
        dst.put_i32(item.sequence);
        dst.put_u32(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
