//! Fixed-size request header: magic, opcode, body length.

use crate::opcode::Opcode;
use std::convert::TryFrom;
use thiserror::Error;

/// Compile-time magic value every request must carry.
pub const MAGIC: u32 = 0x494e_4643; // "INFC"

/// `magic(4) + op(1) + reserved(3) + body_size(4)`.
pub const HEADER_SIZE: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("short header: got {0} bytes, need {HEADER_SIZE}")]
    Truncated(usize),
    #[error("bad magic: 0x{0:08x}")]
    BadMagic(u32),
    #[error("unknown opcode byte {0}")]
    UnknownOpcode(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub op: Opcode,
    pub body_size: u32,
}

impl Header {
    pub fn new(op: Opcode, body_size: u32) -> Self {
        Self {
            magic: MAGIC,
            op,
            body_size,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4] = self.op as u8;
        // buf[5..8] stays zeroed (reserved/pad)
        buf[8..12].copy_from_slice(&self.body_size.to_le_bytes());
        buf
    }

    /// Decodes a header and validates its magic, uniformly for every opcode
    /// (including `SYNC`, even though `infinistore.cpp` skips the check for
    /// that one).
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated(buf.len()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(HeaderError::BadMagic(magic));
        }
        let op = Opcode::try_from(buf[4]).map_err(|_| HeaderError::UnknownOpcode(buf[4]))?;
        let body_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        Ok(Self {
            magic,
            op,
            body_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let h = Header::new(Opcode::RdmaWrite, 42);
        let bytes = h.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn rejects_truncated() {
        let bytes = [0u8; HEADER_SIZE - 1];
        assert_eq!(Header::decode(&bytes), Err(HeaderError::Truncated(11)));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Header::new(Opcode::Sync, 0).encode();
        bytes[0] ^= 0xff;
        assert!(matches!(
            Header::decode(&bytes),
            Err(HeaderError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut bytes = Header::new(Opcode::Sync, 0).encode();
        bytes[4] = 200;
        assert_eq!(
            Header::decode(&bytes),
            Err(HeaderError::UnknownOpcode(200))
        );
    }
}
