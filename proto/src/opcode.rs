//! Request opcodes carried in the fixed header.

use std::convert::TryFrom;

/// One byte identifying the handler a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Cache-ingress via GPU (device -> host).
    Write = 1,
    /// Cache-egress via GPU (host -> device).
    Read = 2,
    /// Report the number of in-flight copy batches.
    Sync = 3,
    /// RDMA queue-pair bring-up handshake.
    RdmaExchange = 4,
    /// Single-key existence check.
    CheckExist = 5,
    /// Longest-matching-prefix lookup over an ordered key list.
    GetMatchLastIdx = 6,
    /// Allocate slabs for a remote peer and hand out remote keys.
    RdmaWrite = 7,
    /// Look up slabs for a remote peer and hand out remote keys.
    RdmaRead = 8,
}

impl Opcode {
    /// Whether a request with this opcode carries a body. Only `Sync` has none.
    pub fn has_body(self) -> bool {
        !matches!(self, Opcode::Sync)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Write => "W",
            Opcode::Read => "R",
            Opcode::Sync => "SYNC",
            Opcode::RdmaExchange => "RDMA_EXCHANGE",
            Opcode::CheckExist => "CHECK_EXIST",
            Opcode::GetMatchLastIdx => "GET_MATCH_LAST_IDX",
            Opcode::RdmaWrite => "RDMA_WRITE",
            Opcode::RdmaRead => "RDMA_READ",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Opcode::Write,
            2 => Opcode::Read,
            3 => Opcode::Sync,
            4 => Opcode::RdmaExchange,
            5 => Opcode::CheckExist,
            6 => Opcode::GetMatchLastIdx,
            7 => Opcode::RdmaWrite,
            8 => Opcode::RdmaRead,
            _ => return Err(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_opcode_rejected() {
        assert!(Opcode::try_from(0).is_err());
        assert!(Opcode::try_from(9).is_err());
    }

    #[test]
    fn only_sync_has_no_body() {
        assert!(!Opcode::Sync.has_body());
        for op in [
            Opcode::Write,
            Opcode::Read,
            Opcode::RdmaExchange,
            Opcode::CheckExist,
            Opcode::GetMatchLastIdx,
            Opcode::RdmaWrite,
            Opcode::RdmaRead,
        ] {
            assert!(op.has_body());
        }
    }
}
