//! Wire format for RDMA endpoint info exchanged by `RDMA_EXCHANGE`.
//!
//! Encoded by hand rather than through `bincode`: the layout is fixed at 28
//! bytes (`qpn:4 + psn:4 + gid:16` plus 4 bytes of reserved padding) to match
//! the wire size the client library expects.

use thiserror::Error;

pub const ENDPOINT_WIRE_SIZE: usize = 28;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("short endpoint body: got {0} bytes, need at least 24")]
pub struct TruncatedEndpoint(pub usize);

/// `{ queue_pair_number: u32, packet_sequence_number: u24, gid: [u8; 16] }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpEndpointWire {
    pub qpn: u32,
    /// Only the low 24 bits are meaningful.
    pub psn: u32,
    pub gid: [u8; 16],
}

impl QpEndpointWire {
    pub fn to_bytes(&self) -> [u8; ENDPOINT_WIRE_SIZE] {
        let mut buf = [0u8; ENDPOINT_WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.qpn.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.psn & 0x00ff_ffff).to_le_bytes());
        buf[8..24].copy_from_slice(&self.gid);
        // buf[24..28] stays zeroed (reserved).
        buf
    }

    /// Accepts any buffer of at least 24 bytes (the minimum to carry
    /// qpn+psn+gid); trailing padding, if present, is ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, TruncatedEndpoint> {
        if buf.len() < 24 {
            return Err(TruncatedEndpoint(buf.len()));
        }
        let qpn = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let psn = u32::from_le_bytes(buf[4..8].try_into().unwrap()) & 0x00ff_ffff;
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[8..24]);
        Ok(Self { qpn, psn, gid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_28_bytes() {
        let ep = QpEndpointWire {
            qpn: 0x1234,
            psn: 0x00ab_cdef,
            gid: [9u8; 16],
        };
        let bytes = ep.to_bytes();
        assert_eq!(bytes.len(), ENDPOINT_WIRE_SIZE);
        assert_eq!(QpEndpointWire::from_bytes(&bytes).unwrap(), ep);
    }

    #[test]
    fn psn_is_masked_to_24_bits() {
        let ep = QpEndpointWire {
            qpn: 1,
            psn: 0xffff_ffff,
            gid: [0u8; 16],
        };
        let decoded = QpEndpointWire::from_bytes(&ep.to_bytes()).unwrap();
        assert_eq!(decoded.psn, 0x00ff_ffff);
    }

    #[test]
    fn rejects_truncated() {
        let buf = [0u8; 23];
        assert_eq!(
            QpEndpointWire::from_bytes(&buf),
            Err(TruncatedEndpoint(23))
        );
    }
}
