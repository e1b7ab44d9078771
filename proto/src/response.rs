//! Response framing: `{ return_code: i32, [payload_size: i32, payload] }`.

/// Return codes carried in every response's first four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReturnCode {
    /// Normal synchronous completion.
    Finish = 0,
    /// Request queued; caller must follow up with `SYNC`.
    TaskAccepted = 1,
    /// At least one referenced key was absent.
    KeyNotFound = 2,
    /// Bad magic or unknown opcode.
    InvalidReq = 3,
    /// Decode failure, allocator exhaustion, or an RDMA/GPU runtime failure.
    SystemError = 4,
}

impl ReturnCode {
    pub fn encode(self) -> [u8; 4] {
        (self as i32).to_le_bytes()
    }
}

/// Builds a status-only response frame (just the return code).
pub fn status_frame(code: ReturnCode) -> Vec<u8> {
    code.encode().to_vec()
}

/// Builds a response frame carrying a structured payload.
pub fn payload_frame(code: ReturnCode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + payload.len());
    out.extend_from_slice(&code.encode());
    out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Builds a response frame carrying a raw little-endian `i32` (used by
/// `SYNC`, `CHECK_EXIST`, `GET_MATCH_LAST_IDX`).
pub fn i32_frame(code: ReturnCode, value: i32) -> Vec<u8> {
    payload_frame(code, &value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_frame_is_four_bytes() {
        let frame = status_frame(ReturnCode::TaskAccepted);
        assert_eq!(frame, ReturnCode::TaskAccepted.encode().to_vec());
        assert_eq!(frame.len(), 4);
    }

    #[test]
    fn payload_frame_layout() {
        let frame = payload_frame(ReturnCode::Finish, &[1, 2, 3]);
        assert_eq!(&frame[0..4], &ReturnCode::Finish.encode());
        assert_eq!(&frame[4..8], &3i32.to_le_bytes());
        assert_eq!(&frame[8..], &[1, 2, 3]);
    }

    #[test]
    fn i32_frame_round_trips_value() {
        let frame = i32_frame(ReturnCode::Finish, -1);
        let value = i32::from_le_bytes(frame[8..12].try_into().unwrap());
        assert_eq!(value, -1);
    }
}
