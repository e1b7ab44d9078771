//! Request Dispatcher: routes a decoded opcode to its handler and builds
//! the response frame.

use crate::connection::ConnectionContext;
use crate::copy_orchestrator::{self, PlannedCopy};
use crate::state::AppState;
use gpu::CopyDirection;
use log::warn;
use proto::{
    i32_frame, payload_frame, status_frame, Header, KeysList, LocalMeta, Opcode, QpEndpointWire,
    RemoteBlock, RemoteMetaRequest, RemoteMetaResponse, ReturnCode,
};

/// Handles one fully-parsed request and returns the bytes to write back to
/// the socket, verbatim.
pub fn dispatch(state: &AppState, ctx: &mut ConnectionContext, header: &Header, body: &[u8]) -> Vec<u8> {
    match header.op {
        Opcode::Write => handle_write(state, ctx, body),
        Opcode::Read => handle_read(state, ctx, body),
        Opcode::Sync => handle_sync(ctx),
        Opcode::RdmaExchange => handle_rdma_exchange(state, ctx, body),
        Opcode::CheckExist => handle_check_exist(state, body),
        Opcode::GetMatchLastIdx => handle_get_match_last_idx(state, body),
        Opcode::RdmaWrite => handle_rdma_alloc_for_remote(state, body),
        Opcode::RdmaRead => handle_rdma_lookup_for_remote(state, body),
    }
}

fn decode_local_meta(body: &[u8]) -> Option<LocalMeta> {
    LocalMeta::decode(body).ok()
}

fn handle_write(state: &AppState, ctx: &mut ConnectionContext, body: &[u8]) -> Vec<u8> {
    let Some(meta) = decode_local_meta(body) else {
        return status_frame(ReturnCode::SystemError);
    };

    let mut plan = Vec::with_capacity(meta.blocks.len());
    for block in &meta.blocks {
        let (host_address, slab_index) = match state.pool.allocate(meta.block_size as usize) {
            Ok(v) => v,
            Err(e) => {
                warn!("allocator exhausted during W: {}", e);
                return status_frame(ReturnCode::SystemError);
            }
        };
        state.cache.insert(
            block.key.clone(),
            cache::CacheEntry {
                host_address,
                byte_length: meta.block_size,
                slab_index,
            },
        );
        plan.push(PlannedCopy {
            host_address,
            device_offset: block.offset,
        });
    }

    submit_and_accept(state, ctx, meta.ipc_handle, meta.block_size, plan, CopyDirection::DeviceToHost)
}

fn handle_read(state: &AppState, ctx: &mut ConnectionContext, body: &[u8]) -> Vec<u8> {
    let Some(meta) = decode_local_meta(body) else {
        return status_frame(ReturnCode::SystemError);
    };

    let mut plan = Vec::with_capacity(meta.blocks.len());
    for block in &meta.blocks {
        let Some(entry) = state.cache.lookup(&block.key) else {
            // Copies already submitted for earlier blocks in this batch are
            // left to drain rather than rolled back.
            return status_frame(ReturnCode::KeyNotFound);
        };
        plan.push(PlannedCopy {
            host_address: entry.host_address,
            device_offset: block.offset,
        });
    }

    submit_and_accept(state, ctx, meta.ipc_handle, meta.block_size, plan, CopyDirection::HostToDevice)
}

fn submit_and_accept(
    state: &AppState,
    ctx: &mut ConnectionContext,
    ipc_handle: gpu::IpcHandle,
    block_size: u64,
    plan: Vec<PlannedCopy>,
    direction: CopyDirection,
) -> Vec<u8> {
    let tx = ctx.completion_tx.clone();
    match copy_orchestrator::submit_batch(
        state.gpu.clone(),
        ctx.copy_stream,
        ipc_handle,
        block_size,
        plan,
        direction,
        tx,
    ) {
        Ok(()) => {
            ctx.in_flight_copies += 1;
            status_frame(ReturnCode::TaskAccepted)
        }
        Err(e) => {
            warn!("copy batch submission failed: {}", e);
            status_frame(ReturnCode::SystemError)
        }
    }
}

fn handle_sync(ctx: &ConnectionContext) -> Vec<u8> {
    i32_frame(ReturnCode::Finish, ctx.in_flight_copies)
}

fn handle_rdma_exchange(state: &AppState, ctx: &mut ConnectionContext, body: &[u8]) -> Vec<u8> {
    let Ok(remote) = QpEndpointWire::from_bytes(body) else {
        return status_frame(ReturnCode::SystemError);
    };

    // A connection's CQ/QP are created on its first RDMA_EXCHANGE, not on
    // accept; a second exchange reuses the existing session and `bring_up`
    // rejects it once it's in RTS.
    if ctx.rdma_session.is_none() {
        match rdma::RdmaSession::create(state.device.clone()) {
            Ok(session) => ctx.rdma_session = Some(session),
            Err(e) => {
                warn!("RDMA session creation failed: {}", e);
                return status_frame(ReturnCode::SystemError);
            }
        }
    }

    let session = ctx
        .rdma_session
        .as_mut()
        .expect("just created or already present");

    if let Err(e) = session.bring_up(&remote) {
        warn!("RDMA bring-up failed: {}", e);
        return status_frame(ReturnCode::SystemError);
    }

    let local = session.local_endpoint();
    payload_frame(ReturnCode::Finish, &local.to_bytes())
}

fn handle_check_exist(state: &AppState, body: &[u8]) -> Vec<u8> {
    let Ok(key) = std::str::from_utf8(body) else {
        return status_frame(ReturnCode::SystemError);
    };
    // 0 = present, 1 = absent.
    let present = if state.cache.contains(key) { 0i32 } else { 1i32 };
    i32_frame(ReturnCode::Finish, present)
}

fn handle_get_match_last_idx(state: &AppState, body: &[u8]) -> Vec<u8> {
    let Ok(keys) = KeysList::decode(body) else {
        return status_frame(ReturnCode::SystemError);
    };
    let last = state.cache.longest_matching_prefix_length(&keys.keys);
    i32_frame(ReturnCode::Finish, last)
}

fn handle_rdma_alloc_for_remote(state: &AppState, body: &[u8]) -> Vec<u8> {
    let Ok(req) = RemoteMetaRequest::decode(body) else {
        return status_frame(ReturnCode::SystemError);
    };

    let mut blocks = Vec::with_capacity(req.keys.len());
    for key in &req.keys {
        let (host_address, slab_index) = match state.pool.allocate(req.block_size as usize) {
            Ok(v) => v,
            Err(e) => {
                warn!("allocator exhausted during RDMA_WRITE: {}", e);
                return status_frame(ReturnCode::SystemError);
            }
        };
        state.cache.insert(
            key.clone(),
            cache::CacheEntry {
                host_address,
                byte_length: req.block_size,
                slab_index,
            },
        );
        blocks.push(RemoteBlock {
            remote_key: state.pool.remote_key(slab_index),
            remote_address: host_address,
        });
    }

    payload_frame(ReturnCode::TaskAccepted, &RemoteMetaResponse { blocks }.encode())
}

fn handle_rdma_lookup_for_remote(state: &AppState, body: &[u8]) -> Vec<u8> {
    let Ok(req) = RemoteMetaRequest::decode(body) else {
        return status_frame(ReturnCode::SystemError);
    };

    let mut blocks = Vec::with_capacity(req.keys.len());
    for key in &req.keys {
        let Some(entry) = state.cache.lookup(key) else {
            return status_frame(ReturnCode::KeyNotFound);
        };
        blocks.push(RemoteBlock {
            remote_key: state.pool.remote_key(entry.slab_index),
            remote_address: entry.host_address,
        });
    }

    payload_frame(ReturnCode::TaskAccepted, &RemoteMetaResponse { blocks }.encode())
}
