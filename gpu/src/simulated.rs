//! A hardware-independent `GpuRuntime` that backs "device" memory with a
//! plain `Vec<u8>` and performs copies immediately rather than truly
//! asynchronously. Lets the cache server and its tests run without a GPU.

use crate::runtime::{CopyDirection, CopyStream, DevicePointer, GpuError, GpuRuntime, IpcHandle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Buffers are addressed as `(id << SHIFT) + offset` so a `DevicePointer`
/// behaves like a real base pointer: callers add a byte offset to it and
/// the runtime recovers which buffer that lands in.
const SHIFT: u32 = 40;

struct Inner {
    next_buffer_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    released: HashSet<u64>,
    next_stream_id: u64,
    streams: HashSet<u64>,
}

pub struct SimulatedRuntime {
    inner: Mutex<Inner>,
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_buffer_id: 1,
                buffers: HashMap::new(),
                released: HashSet::new(),
                next_stream_id: 1,
                streams: HashSet::new(),
            }),
        }
    }

    /// Registers a simulated device allocation and returns the opaque
    /// 64-byte handle a test can hand to `import_shared_buffer` the way a
    /// real client would pass one over the wire in a `LocalMeta`.
    pub fn register_buffer(&self, data: Vec<u8>) -> IpcHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_buffer_id;
        inner.next_buffer_id += 1;
        inner.buffers.insert(id, data);
        let mut handle = [0u8; 64];
        handle[0..8].copy_from_slice(&id.to_le_bytes());
        handle
    }

    /// Reads back the contents of a still-registered buffer, for test
    /// assertions after a simulated copy.
    pub fn inspect_buffer(&self, ptr: DevicePointer) -> Option<Vec<u8>> {
        let id = ptr.0 >> SHIFT;
        self.inner.lock().buffers.get(&id).cloned()
    }

    fn decode(addr: u64) -> (u64, usize) {
        (addr >> SHIFT, (addr & ((1u64 << SHIFT) - 1)) as usize)
    }
}

impl GpuRuntime for SimulatedRuntime {
    fn import_shared_buffer(&self, handle: &IpcHandle) -> Result<DevicePointer, GpuError> {
        let id = u64::from_le_bytes(handle[0..8].try_into().unwrap());
        let mut inner = self.inner.lock();
        if inner.released.contains(&id) || !inner.buffers.contains_key(&id) {
            return Err(GpuError::ImportFailed);
        }
        inner.released.remove(&id);
        Ok(DevicePointer(id << SHIFT))
    }

    fn release_shared_buffer(&self, ptr: DevicePointer) -> Result<(), GpuError> {
        let id = ptr.0 >> SHIFT;
        let mut inner = self.inner.lock();
        if !inner.buffers.contains_key(&id) {
            return Err(GpuError::UnknownPointer);
        }
        inner.released.insert(id);
        Ok(())
    }

    fn create_ordered_copy_stream(&self) -> Result<CopyStream, GpuError> {
        let mut inner = self.inner.lock();
        let id = inner.next_stream_id;
        inner.next_stream_id += 1;
        inner.streams.insert(id);
        Ok(CopyStream(id))
    }

    fn destroy_copy_stream(&self, stream: CopyStream) -> Result<(), GpuError> {
        let mut inner = self.inner.lock();
        if !inner.streams.remove(&stream.0) {
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
        let mut inner = self.inner.lock();
        if !inner.streams.contains(&stream.0) {
            return Err(GpuError::UnknownStream);
        }

        match direction {
            CopyDirection::DeviceToHost => {
                let (id, offset) = Self::decode(src);
                let buf = inner.buffers.get(&id).ok_or(GpuError::EnqueueFailed)?;
                if offset + bytes > buf.len() {
                    return Err(GpuError::EnqueueFailed);
                }
                let slice = &buf[offset..offset + bytes];
                // `dst` is a real pinned-host address in the caller's
                // process; this mirrors what a DMA engine would do.
                unsafe {
                    std::ptr::copy_nonoverlapping(slice.as_ptr(), dst as *mut u8, bytes);
                }
            }
            CopyDirection::HostToDevice => {
                let (id, offset) = Self::decode(dst);
                let buf = inner.buffers.get_mut(&id).ok_or(GpuError::EnqueueFailed)?;
                if offset + bytes > buf.len() {
                    return Err(GpuError::EnqueueFailed);
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src as *const u8,
                        buf[offset..offset + bytes].as_mut_ptr(),
                        bytes,
                    );
                }
            }
        }
        Ok(())
    }

    fn drain(&self, stream: CopyStream) -> Result<(), GpuError> {
        // Copies run synchronously in `enqueue_copy`, so draining only
        // needs to confirm the stream is still live.
        let inner = self.inner.lock();
        if !inner.streams.contains(&stream.0) {
            return Err(GpuError::UnknownStream);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_to_host_copy_moves_bytes() {
        let runtime = SimulatedRuntime::new();
        let handle = runtime.register_buffer(vec![0xAA; 4096]);
        let ptr = runtime.import_shared_buffer(&handle).unwrap();
        let stream = runtime.create_ordered_copy_stream().unwrap();

        let mut host_buf = vec![0u8; 4096];
        runtime
            .enqueue_copy(
                stream,
                ptr.0,
                host_buf.as_mut_ptr() as u64,
                4096,
                CopyDirection::DeviceToHost,
            )
            .unwrap();
        runtime.drain(stream).unwrap();

        assert!(host_buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn host_to_device_copy_moves_bytes() {
        let runtime = SimulatedRuntime::new();
        let handle = runtime.register_buffer(vec![0u8; 4096]);
        let ptr = runtime.import_shared_buffer(&handle).unwrap();
        let stream = runtime.create_ordered_copy_stream().unwrap();

        let host_buf = vec![0xBBu8; 4096];
        runtime
            .enqueue_copy(
                stream,
                host_buf.as_ptr() as u64,
                ptr.0,
                4096,
                CopyDirection::HostToDevice,
            )
            .unwrap();
        runtime.drain(stream).unwrap();

        let contents = runtime.inspect_buffer(ptr).unwrap();
        assert!(contents.iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn released_buffer_rejects_reimport() {
        let runtime = SimulatedRuntime::new();
        let handle = runtime.register_buffer(vec![0u8; 16]);
        let ptr = runtime.import_shared_buffer(&handle).unwrap();
        runtime.release_shared_buffer(ptr).unwrap();
        assert!(runtime.import_shared_buffer(&handle).is_err());
    }

    #[test]
    fn copy_past_buffer_end_is_rejected() {
        let runtime = SimulatedRuntime::new();
        let handle = runtime.register_buffer(vec![0u8; 16]);
        let ptr = runtime.import_shared_buffer(&handle).unwrap();
        let stream = runtime.create_ordered_copy_stream().unwrap();
        let mut host_buf = vec![0u8; 4096];
        let result = runtime.enqueue_copy(
            stream,
            ptr.0,
            host_buf.as_mut_ptr() as u64,
            4096,
            CopyDirection::DeviceToHost,
        );
        assert!(result.is_err());
    }

    #[test]
    fn destroyed_stream_rejects_further_use() {
        let runtime = SimulatedRuntime::new();
        let stream = runtime.create_ordered_copy_stream().unwrap();
        runtime.destroy_copy_stream(stream).unwrap();
        assert!(runtime.drain(stream).is_err());
    }
}
