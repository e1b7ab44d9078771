//! Structured request/response bodies.
//!
//! These are opaque to everyone but this repository's own client: the only
//! contract is `decode(encode(x)) == x` and that decoding a truncated or
//! malformed buffer returns a [`CodecError`], never panics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode body: {0}")]
    Decode(#[from] Box<bincode::ErrorKind>),
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    // A plain Rust value can never fail bincode serialization (no I/O, no
    // fallible custom Serialize impls in this crate).
    bincode::serialize(value).expect("structured body serialization is infallible")
}

fn decode<T: for<'de> Deserialize<'de>>(buf: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(buf).map_err(CodecError::from)
}

/// One block within a `W`/`R` batch: which cache key, and at what byte
/// offset into the caller's GPU buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOffset {
    pub key: String,
    pub offset: u64,
}

/// Body of `W` (ingress) and `R` (egress) requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMeta {
    /// Opaque GPU IPC handle, fixed at 64 bytes.
    pub ipc_handle: [u8; 64],
    pub block_size: u64,
    pub blocks: Vec<BlockOffset>,
}

impl LocalMeta {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        decode(buf)
    }
}

/// Body of `RDMA_WRITE` and `RDMA_READ` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetaRequest {
    pub block_size: u64,
    pub keys: Vec<String>,
}

impl RemoteMetaRequest {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        decode(buf)
    }
}

/// One slab's remote-access coordinates, handed out to a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBlock {
    pub remote_key: u32,
    pub remote_address: u64,
}

/// Response payload of `RDMA_WRITE`/`RDMA_READ` on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteMetaResponse {
    pub blocks: Vec<RemoteBlock>,
}

impl RemoteMetaResponse {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        decode(buf)
    }
}

/// Body of `GET_MATCH_LAST_IDX` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeysList {
    pub keys: Vec<String>,
}

impl KeysList {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_meta_round_trip() {
        let meta = LocalMeta {
            ipc_handle: [7u8; 64],
            block_size: 4096,
            blocks: vec![
                BlockOffset {
                    key: "a".into(),
                    offset: 0,
                },
                BlockOffset {
                    key: "b".into(),
                    offset: 4096,
                },
            ],
        };
        let encoded = meta.encode();
        assert_eq!(LocalMeta::decode(&encoded).unwrap(), meta);
    }

    #[test]
    fn remote_meta_request_round_trip() {
        let req = RemoteMetaRequest {
            block_size: 32 << 10,
            keys: vec!["x".into(), "y".into()],
        };
        let encoded = req.encode();
        assert_eq!(RemoteMetaRequest::decode(&encoded).unwrap(), req);
    }

    #[test]
    fn remote_meta_response_round_trip() {
        let resp = RemoteMetaResponse {
            blocks: vec![RemoteBlock {
                remote_key: 0xdead_beef,
                remote_address: 0x1000,
            }],
        };
        let encoded = resp.encode();
        assert_eq!(RemoteMetaResponse::decode(&encoded).unwrap(), resp);
    }

    #[test]
    fn keys_list_round_trip() {
        let list = KeysList {
            keys: vec!["k0".into(), "k1".into(), "k2".into()],
        };
        let encoded = list.encode();
        assert_eq!(KeysList::decode(&encoded).unwrap(), list);
    }

    #[test]
    fn truncated_buffer_is_decode_error_not_panic() {
        let req = RemoteMetaRequest {
            block_size: 1,
            keys: vec!["k".into()],
        };
        let mut encoded = req.encode();
        encoded.truncate(encoded.len() / 2);
        assert!(RemoteMetaRequest::decode(&encoded).is_err());
    }

    #[test]
    fn garbage_buffer_is_decode_error_not_panic() {
        let garbage = vec![0xffu8; 3];
        assert!(LocalMeta::decode(&garbage).is_err());
    }
}
