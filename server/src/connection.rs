//! Connection State Machine: per-connection HEADER/BODY request assembly,
//! driven off whatever-sized chunk the socket handed us this read —
//! mirroring `infinistore.cpp`'s `on_read`, which walks a single `libuv`
//! read buffer through possibly several pipelined requests before going
//! back to the kernel for more bytes.

use crate::dispatcher;
use crate::state::AppState;
use gpu::CopyStream;
use log::{debug, info, warn};
use proto::{status_frame, Header, HeaderError, ReturnCode, HEADER_SIZE};
use rdma::RdmaSession;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Size of the chunk read from the socket per syscall; matches
/// `infinistore.cpp`'s `BUFFER_SIZE`.
const READ_CHUNK_BYTES: usize = 64 << 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParsePhase {
    Header,
    Body,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// Incrementally assembles `(Header, body)` request frames out of however
/// many bytes arrive in a single socket read. `feed` never blocks and never
/// dispatches a request itself; it just returns every frame that became
/// complete during this call, in arrival order, so pipelined requests in the
/// same read are consumed in order.
struct FrameAssembler {
    phase: ParsePhase,
    header_buf: Vec<u8>,
    header: Option<Header>,
    body_buf: Vec<u8>,
}

impl FrameAssembler {
    fn new() -> Self {
        Self {
            phase: ParsePhase::Header,
            header_buf: Vec::with_capacity(HEADER_SIZE),
            header: None,
            body_buf: Vec::new(),
        }
    }

    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<(Header, Vec<u8>)>, FrameError> {
        let mut offset = 0usize;
        let mut completed = Vec::new();

        while offset < chunk.len() {
            match self.phase {
                ParsePhase::Header => {
                    let need = HEADER_SIZE - self.header_buf.len();
                    let take = need.min(chunk.len() - offset);
                    self.header_buf.extend_from_slice(&chunk[offset..offset + take]);
                    offset += take;

                    if self.header_buf.len() == HEADER_SIZE {
                        let header = Header::decode(&self.header_buf)?;
                        self.header_buf.clear();

                        if header.op.has_body() {
                            self.body_buf = Vec::with_capacity(header.body_size as usize);
                            self.header = Some(header);
                            self.phase = ParsePhase::Body;
                        } else {
                            // Only SYNC has no body; dispatch immediately
                            // and stay in the HEADER phase.
                            completed.push((header, Vec::new()));
                        }
                    }
                }
                ParsePhase::Body => {
                    let header = self.header.expect("body phase implies a parsed header");
                    let need = header.body_size as usize - self.body_buf.len();
                    let take = need.min(chunk.len() - offset);
                    self.body_buf.extend_from_slice(&chunk[offset..offset + take]);
                    offset += take;

                    if self.body_buf.len() == header.body_size as usize {
                        completed.push((header, std::mem::take(&mut self.body_buf)));
                        self.header = None;
                        self.phase = ParsePhase::Header;
                    }
                }
            }
        }

        Ok(completed)
    }
}

/// Per-connection state owned exclusively by one connection: its copy
/// stream, its RDMA session (absent until `RDMA_EXCHANGE`), and the count of
/// copy batches still draining on worker threads.
pub struct ConnectionContext {
    pub copy_stream: CopyStream,
    pub rdma_session: Option<RdmaSession>,
    pub in_flight_copies: i32,
    pub completion_tx: mpsc::UnboundedSender<()>,
}

/// Drains one accepted socket until disconnect, feeding it through a
/// [`FrameAssembler`] and dispatching each completed request in order.
pub async fn run(state: Arc<AppState>, socket: TcpStream, peer: SocketAddr) {
    if let Err(e) = socket.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let copy_stream = match state.gpu.create_ordered_copy_stream() {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to create copy stream for {}: {}", peer, e);
            return;
        }
    };

    let (tx, mut completion_rx) = mpsc::unbounded_channel();
    let mut ctx = ConnectionContext {
        copy_stream,
        rdma_session: None,
        in_flight_copies: 0,
        completion_tx: tx,
    };

    let (mut reader, mut writer) = socket.into_split();
    let mut assembler = FrameAssembler::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    'conn: loop {
        tokio::select! {
            read_result = reader.read(&mut buf) => {
                match read_result {
                    Ok(0) => {
                        debug!("{} closed the connection", peer);
                        break 'conn;
                    }
                    Ok(n) => {
                        let frames = match assembler.feed(&buf[..n]) {
                            Ok(frames) => frames,
                            Err(e) => {
                                // Header verification failure before body
                                // framing is known: respond INVALID_REQ,
                                // best-effort, then close the connection.
                                warn!("{}: {}", peer, e);
                                let _ = writer.write_all(&status_frame(ReturnCode::InvalidReq)).await;
                                break 'conn;
                            }
                        };

                        for (header, body) in frames {
                            let started = std::time::Instant::now();
                            let response = dispatcher::dispatch(&state, &mut ctx, &header, &body);
                            info!(
                                "{} {} took {:.3}ms",
                                peer,
                                header.op.name(),
                                started.elapsed().as_secs_f64() * 1000.0
                            );
                            if let Err(e) = writer.write_all(&response).await {
                                warn!("{}: write failed: {}", peer, e);
                                break 'conn;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("{}: read failed: {}", peer, e);
                        break 'conn;
                    }
                }
            }
            Some(()) = completion_rx.recv() => {
                ctx.in_flight_copies -= 1;
                debug_assert!(ctx.in_flight_copies >= 0, "in_flight_copies went negative");
            }
        }
    }

    // Copy batches already submitted by this connection are allowed to
    // drain on worker threads; their completion callback will find the
    // channel's receiver gone and simply drop the notification.
    // `rdma_session`'s own Drop moves the QP to ERROR and destroys it.
    if let Err(e) = state.gpu.destroy_copy_stream(ctx.copy_stream) {
        warn!("{}: failed to destroy copy stream: {}", peer, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::Opcode;

    fn header_bytes(op: Opcode, body_size: u32) -> [u8; HEADER_SIZE] {
        Header::new(op, body_size).encode()
    }

    #[test]
    fn single_chunk_with_full_frame() {
        let mut asm = FrameAssembler::new();
        let mut chunk = header_bytes(Opcode::CheckExist, 3).to_vec();
        chunk.extend_from_slice(b"abc");

        let frames = asm.feed(&chunk).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.op, Opcode::CheckExist);
        assert_eq!(frames[0].1, b"abc");
    }

    #[test]
    fn header_split_across_two_chunks() {
        let mut asm = FrameAssembler::new();
        let full = header_bytes(Opcode::Sync, 0);

        assert!(asm.feed(&full[..5]).unwrap().is_empty());
        let frames = asm.feed(&full[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.op, Opcode::Sync);
        assert!(frames[0].1.is_empty());
    }

    #[test]
    fn sync_has_no_body_and_dispatches_on_header_alone() {
        let mut asm = FrameAssembler::new();
        let frames = asm.feed(&header_bytes(Opcode::Sync, 0)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1.len(), 0);
    }

    #[test]
    fn two_pipelined_requests_in_one_chunk_both_complete() {
        let mut asm = FrameAssembler::new();
        let mut chunk = header_bytes(Opcode::CheckExist, 1).to_vec();
        chunk.push(b'a');
        chunk.extend_from_slice(&header_bytes(Opcode::CheckExist, 1));
        chunk.push(b'b');

        let frames = asm.feed(&chunk).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1, b"a");
        assert_eq!(frames[1].1, b"b");
    }

    #[test]
    fn body_split_across_chunks_accumulates() {
        let mut asm = FrameAssembler::new();
        let header = header_bytes(Opcode::CheckExist, 6);

        assert!(asm.feed(&header).unwrap().is_empty());
        assert!(asm.feed(b"ab").unwrap().is_empty());
        assert!(asm.feed(b"cd").unwrap().is_empty());
        let frames = asm.feed(b"ef").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, b"abcdef");
    }

    #[test]
    fn bad_magic_surfaces_as_frame_error() {
        let mut asm = FrameAssembler::new();
        let mut bytes = header_bytes(Opcode::Sync, 0);
        bytes[0] ^= 0xff;
        assert!(asm.feed(&bytes).is_err());
    }
}
