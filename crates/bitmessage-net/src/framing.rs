//! Wire framing for the Bitmessage peer protocol (spec.md §4.6).
//!
//! Every frame: `magic(4 BE) || command(12, ASCII NUL-padded) ||
//! length(u32 BE) || checksum(4) || payload`, where `checksum =
//! SHA-512(payload)[0..4]`.

use bitmessage_core::crypto::sha512;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// `0xE9BEB4D9`, read as a 4-byte big-endian magic.
pub const MAGIC: u32 = 0xE9BE_B4D9;
/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 1_600_003;
const HEADER_LEN: usize = 4 + 12 + 4 + 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),
    #[error("payload checksum mismatch")]
    BadChecksum,
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD} byte limit")]
    Oversized(usize),
    #[error("command is not valid ASCII or exceeds 12 bytes: {0:?}")]
    BadCommand(Vec<u8>),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single wire frame: a command name and its opaque payload bytes. The
/// payload is interpreted by the caller according to `command`
/// (`"version"`, `"verack"`, `"inv"`, `"getdata"`, `"object"`, `"addr"`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }

    fn command_bytes(&self) -> Result<[u8; 12], FrameError> {
        let bytes = self.command.as_bytes();
        if bytes.len() > 12 || !bytes.is_ascii() {
            return Err(FrameError::BadCommand(bytes.to_vec()));
        }
        let mut out = [0u8; 12];
        out[..bytes.len()].copy_from_slice(bytes);
        Ok(out)
    }
}

/// Codec bridging raw bytes and [`Frame`]s over a `tokio_util::codec::Framed`
/// transport.
#[derive(Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let command_raw = &src[4..16];
        let length = u32::from_be_bytes([src[16], src[17], src[18], src[19]]) as usize;
        let checksum = [src[20], src[21], src[22], src[23]];

        if length > MAX_PAYLOAD {
            return Err(FrameError::Oversized(length));
        }
        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let nul_at = command_raw.iter().position(|&b| b == 0).unwrap_or(12);
        let command = String::from_utf8(command_raw[..nul_at].to_vec())
            .map_err(|_| FrameError::BadCommand(command_raw.to_vec()))?;

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).to_vec();

        let actual_checksum = &sha512(&payload)[0..4];
        if actual_checksum != checksum {
            return Err(FrameError::BadChecksum);
        }

        Ok(Some(Frame { command, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::Oversized(item.payload.len()));
        }
        let command_bytes = item.command_bytes()?;
        let checksum = sha512(&item.payload);

        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32(MAGIC);
        dst.put_slice(&command_bytes);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&checksum[0..4]);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut codec = FrameCodec;
        let frame = Frame::new("object", vec![1, 2, 3, 4, 5]);

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_waits_for_full_payload() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new("inv", vec![9; 100]), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::new("verack", vec![]), &mut buf).unwrap();
        buf[0] ^= 0xFF;
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::BadMagic(_))));
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new("object", vec![1, 2, 3]), &mut buf)
            .unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::BadChecksum)));
    }

    #[test]
    fn oversized_payload_is_rejected_on_encode() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let huge = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            codec.encode(Frame::new("object", huge), &mut buf),
            Err(FrameError::Oversized(_))
        ));
    }
}
