//! `GpuRuntime` backed by the real CUDA runtime, built only when the `cuda`
//! feature is enabled and the toolkit was found at build time.

#![cfg(feature = "cuda")]

use crate::runtime::{CopyDirection, CopyStream, DevicePointer, GpuError, GpuRuntime, IpcHandle};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::raw::c_void;

#[allow(non_upper_case_globals, non_camel_case_types, non_snake_case, dead_code)]
mod ffi {
    include!(concat!(env!("OUT_DIR"), "/cuda_bindings.rs"));
}

use ffi::*;

/// Maps our opaque `CopyStream`/`DevicePointer` ids to the underlying CUDA
/// handles, since those aren't `Send`-safe to hand out directly.
#[derive(Default)]
pub struct CudaRuntime {
    streams: Mutex<HashMap<u64, cudaStream_t>>,
    next_stream_id: Mutex<u64>,
}

unsafe impl Send for CudaRuntime {}
unsafe impl Sync for CudaRuntime {}

impl CudaRuntime {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            next_stream_id: Mutex::new(1),
        }
    }
}

impl GpuRuntime for CudaRuntime {
    fn import_shared_buffer(&self, handle: &IpcHandle) -> Result<DevicePointer, GpuError> {
        let mut cuda_handle: cudaIpcMemHandle_t = unsafe { std::mem::zeroed() };
        for (dst, src) in cuda_handle.reserved.iter_mut().zip(handle.iter()) {
            *dst = *src as std::os::raw::c_char;
        }

        let mut device_ptr: *mut c_void = std::ptr::null_mut();
        let ret = unsafe {
            cudaIpcOpenMemHandle(
                &mut device_ptr,
                cuda_handle,
                cudaIpcMemLazyEnablePeerAccess,
            )
        };
        if ret != cudaError_t::cudaSuccess || device_ptr.is_null() {
            return Err(GpuError::ImportFailed);
        }
        debug!("imported CUDA IPC handle -> {:?}", device_ptr);
        Ok(DevicePointer(device_ptr as u64))
    }

    fn release_shared_buffer(&self, ptr: DevicePointer) -> Result<(), GpuError> {
        let ret = unsafe { cudaIpcCloseMemHandle(ptr.0 as *mut c_void) };
        if ret != cudaError_t::cudaSuccess {
            return Err(GpuError::UnknownPointer);
        }
        Ok(())
    }

    fn create_ordered_copy_stream(&self) -> Result<CopyStream, GpuError> {
        let mut stream: cudaStream_t = std::ptr::null_mut();
        let ret = unsafe { cudaStreamCreate(&mut stream) };
        if ret != cudaError_t::cudaSuccess {
            return Err(GpuError::StreamCreateFailed);
        }
        let mut next_id = self.next_stream_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.streams.lock().insert(id, stream);
        Ok(CopyStream(id))
    }

    fn destroy_copy_stream(&self, stream: CopyStream) -> Result<(), GpuError> {
        let handle = self
            .streams
            .lock()
            .remove(&stream.0)
            .ok_or(GpuError::UnknownStream)?;
        let ret = unsafe { cudaStreamDestroy(handle) };
        if ret != cudaError_t::cudaSuccess {
            return Err(GpuError::UnknownStream);
        }
        Ok(())
    }

    fn enqueue_copy(
        &self,
        stream: CopyStream,
        src: u64,
        dst: u64,
        bytes: usize,
        direction: CopyDirection,
    ) -> Result<(), GpuError> {
        let streams = self.streams.lock();
        let handle = *streams.get(&stream.0).ok_or(GpuError::UnknownStream)?;
        drop(streams);

        let kind = match direction {
            CopyDirection::DeviceToHost => cudaMemcpyKind::cudaMemcpyDeviceToHost,
            CopyDirection::HostToDevice => cudaMemcpyKind::cudaMemcpyHostToDevice,
        };

        let ret = unsafe {
            cudaMemcpyAsync(
                dst as *mut c_void,
                src as *const c_void,
                bytes,
                kind,
                handle,
            )
        };
        if ret != cudaError_t::cudaSuccess {
            return Err(GpuError::EnqueueFailed);
        }
        Ok(())
    }

    fn drain(&self, stream: CopyStream) -> Result<(), GpuError> {
        let handle = *self
            .streams
            .lock()
            .get(&stream.0)
            .ok_or(GpuError::UnknownStream)?;
        let ret = unsafe { cudaStreamSynchronize(handle) };
        if ret != cudaError_t::cudaSuccess {
            return Err(GpuError::DrainFailed);
        }
        Ok(())
    }
}
