//! RDMA capability interface: device management, queue pair bring-up, and
//! one-sided READ/WRITE, behind a `stub-rdma` feature that lets the rest of
//! the workspace build and test without `libibverbs-dev` or real hardware.

mod device;
mod session;

pub use device::{
    is_ipv4_mapped_gid, DeviceAttributes, PortAttributes, RdmaDevice, RdmaError, RdmaMemoryRegion,
};
pub use session::{QpState, RdmaSession, MAX_WR};
