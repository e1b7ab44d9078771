//! Wire codec: fixed-header framing plus structured request/response bodies.
//!
//! The framing contract: every request is
//! `{ header: Header, body: [u8; header.body_size] }`; every response is
//! `{ return_code: i32, [payload_size: i32, payload] }`, where the payload is
//! present only for handlers that return structured data.

mod body;
mod endpoint;
mod header;
mod opcode;
mod response;

pub use body::{
    BlockOffset, CodecError, KeysList, LocalMeta, RemoteBlock, RemoteMetaRequest,
    RemoteMetaResponse,
};
pub use endpoint::{QpEndpointWire, TruncatedEndpoint, ENDPOINT_WIRE_SIZE};
pub use header::{Header, HeaderError, HEADER_SIZE, MAGIC};
pub use opcode::Opcode;
pub use response::{i32_frame, payload_frame, status_frame, ReturnCode};
