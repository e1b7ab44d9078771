//! The GPU capability interface: import/release of an inter-process device
//! buffer handle, and an ordered asynchronous device<->host copy stream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to import IPC handle")]
    ImportFailed,
    #[error("unknown or already-released device pointer")]
    UnknownPointer,
    #[error("failed to create copy stream")]
    StreamCreateFailed,
    #[error("unknown or already-destroyed copy stream")]
    UnknownStream,
    #[error("copy enqueue failed")]
    EnqueueFailed,
    #[error("stream drain failed")]
    DrainFailed,
    #[cfg(feature = "cuda")]
    #[error("CUDA runtime error: {0}")]
    Cuda(i32),
}

/// The 64-byte opaque handle a GPU-owning client hands the server in a
/// `LocalMeta` to share one of its device allocations.
pub type IpcHandle = [u8; 64];

/// A device-side base pointer obtained by importing an `IpcHandle`. Valid
/// only within the process and only until `release_shared_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePointer(pub u64);

/// An ordered copy stream: copies enqueued on the same stream complete in
/// submission order; no ordering is implied across streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyStream(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    DeviceToHost,
    HostToDevice,
}

/// Capability interface the Copy Orchestrator drives. `SimulatedRuntime` is
/// the default, hardware-independent implementation; `CudaRuntime` (behind
/// the `cuda` feature) drives the real CUDA runtime.
pub trait GpuRuntime: Send + Sync {
    fn import_shared_buffer(&self, handle: &IpcHandle) -> Result<DevicePointer, GpuError>;
    fn release_shared_buffer(&self, ptr: DevicePointer) -> Result<(), GpuError>;
    fn create_ordered_copy_stream(&self) -> Result<CopyStream, GpuError>;
    fn destroy_copy_stream(&self, stream: CopyStream) -> Result<(), GpuError>;
    fn enqueue_copy(
        &self,
        stream: CopyStream,
        src: u64,
        dst: u64,
        bytes: usize,
        direction: CopyDirection,
    ) -> Result<(), GpuError>;
    /// Blocks until every copy enqueued on `stream` has completed.
    fn drain(&self, stream: CopyStream) -> Result<(), GpuError>;
}
