//! GPU capability interface: shared-buffer import/release and an ordered
//! asynchronous device<->host copy stream. `SimulatedRuntime` is
//! the default, hardware-independent implementation used everywhere a real
//! GPU isn't available; `CudaRuntime` (the `cuda` feature) drives the real
//! CUDA runtime.

mod runtime;
mod simulated;

#[cfg(feature = "cuda")]
mod cuda;

pub use runtime::{CopyDirection, CopyStream, DevicePointer, GpuError, GpuRuntime, IpcHandle};
pub use simulated::SimulatedRuntime;

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;
