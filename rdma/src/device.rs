//! RDMA device discovery, protection domain, and memory registration.

use log::{debug, info, warn};
use std::ffi::CStr;
use std::ptr;
use std::sync::Arc;
use thiserror::Error;

#[cfg(not(feature = "stub-rdma"))]
pub(crate) mod ffi {
    #![allow(non_upper_case_globals)]
    #![allow(non_camel_case_types)]
    #![allow(non_snake_case)]
    #![allow(dead_code)]
    include!(concat!(env!("OUT_DIR"), "/rdma_bindings.rs"));
}

#[cfg(feature = "stub-rdma")]
pub(crate) mod ffi {
    #![allow(non_camel_case_types)]
    pub type ibv_device = std::ffi::c_void;
    pub type ibv_context = std::ffi::c_void;
    pub type ibv_pd = std::ffi::c_void;
    pub type ibv_mr = std::ffi::c_void;
    pub type ibv_cq = std::ffi::c_void;
    pub type ibv_qp = std::ffi::c_void;
}

use ffi::*;

#[derive(Debug, Error)]
pub enum RdmaError {
    #[error("no RDMA devices found on this host")]
    NoDevices,
    #[error("RDMA device {0:?} not found and no fallback device is present")]
    DeviceNotFound(String),
    #[error("failed to open RDMA device {0:?}")]
    OpenFailed(String),
    #[error("failed to allocate protection domain")]
    PdAllocFailed,
    #[error("failed to query device attributes")]
    QueryDeviceFailed,
    #[error("failed to query port {0}")]
    QueryPortFailed(u8),
    #[error("no RoCEv2/IPv4 GID found on port {0}")]
    NoRoceV2Gid(u8),
    #[error("failed to register memory region")]
    RegisterMemoryFailed,
    #[error("failed to create completion queue")]
    CreateCqFailed,
    #[error("failed to create queue pair")]
    CreateQpFailed,
    #[error("failed to modify queue pair to {0}")]
    ModifyQpFailed(&'static str),
    #[error("RDMA_EXCHANGE received twice on the same session")]
    AlreadyConnected,
    #[error("RDMA support was built with stub-rdma; no real device is available")]
    StubMode,
}

/// RDMA device handle with an allocated protection domain.
///
/// Holds one PD per process: every registered memory region and every queue
/// pair in the process shares this PD, the same single-device assumption
/// `infinistore.cpp` makes by keeping one global `ibv_pd`.
pub struct RdmaDevice {
    context: *mut ibv_context,
    pd: *mut ibv_pd,
    device_name: String,
}

unsafe impl Send for RdmaDevice {}
unsafe impl Sync for RdmaDevice {}

impl RdmaDevice {
    /// Opens `device_name`, falling back to the first device the system
    /// reports if it isn't found (mirrors `infinistore.cpp`'s
    /// open-default-if-named-device-missing behavior).
    pub fn open(device_name: &str) -> Result<Arc<Self>, RdmaError> {
        #[cfg(feature = "stub-rdma")]
        {
            let _ = device_name;
            warn!("rdma: stub-rdma is enabled, no real device will be opened");
            Err(RdmaError::StubMode)
        }

        #[cfg(not(feature = "stub-rdma"))]
        {
            info!("opening RDMA device: {}", device_name);

            let mut num_devices = 0i32;
            let device_list = unsafe { ibv_get_device_list(&mut num_devices) };
            if device_list.is_null() || num_devices == 0 {
                return Err(RdmaError::NoDevices);
            }

            let mut target: *mut ibv_device = ptr::null_mut();
            for i in 0..num_devices {
                let dev = unsafe { *device_list.offset(i as isize) };
                let name = unsafe {
                    CStr::from_ptr(ibv_get_device_name(dev))
                        .to_string_lossy()
                        .into_owned()
                };
                debug!("found RDMA device: {}", name);
                if name == device_name {
                    target = dev;
                    break;
                }
            }

            if target.is_null() {
                warn!(
                    "device {:?} not found, falling back to the first reported device",
                    device_name
                );
                target = unsafe { *device_list };
                if target.is_null() {
                    unsafe { ibv_free_device_list(device_list) };
                    return Err(RdmaError::DeviceNotFound(device_name.to_string()));
                }
            }

            let context = unsafe { ibv_open_device(target) };
            unsafe { ibv_free_device_list(device_list) };

            if context.is_null() {
                return Err(RdmaError::OpenFailed(device_name.to_string()));
            }

            let pd = unsafe { ibv_alloc_pd(context) };
            if pd.is_null() {
                unsafe { ibv_close_device(context) };
                return Err(RdmaError::PdAllocFailed);
            }

            info!("opened RDMA device {:?} with protection domain", device_name);

            Ok(Arc::new(Self {
                context,
                pd,
                device_name: device_name.to_string(),
            }))
        }
    }

    pub fn query_attributes(&self) -> Result<DeviceAttributes, RdmaError> {
        #[cfg(feature = "stub-rdma")]
        {
            Err(RdmaError::StubMode)
        }

        #[cfg(not(feature = "stub-rdma"))]
        {
            let mut attr: ibv_device_attr = unsafe { std::mem::zeroed() };
            let ret = unsafe { ibv_query_device(self.context, &mut attr) };
            if ret != 0 {
                return Err(RdmaError::QueryDeviceFailed);
            }
            Ok(DeviceAttributes {
                max_qp: attr.max_qp,
                max_cq: attr.max_cq,
                max_mr: attr.max_mr,
                max_mr_size: attr.max_mr_size,
            })
        }
    }

    /// Queries port attributes and selects the GID table entry used for
    /// RoCE v2/IPv4, since upstream libibverbs has no public
    /// `ibv_find_sgid_type` to do this for us.
    pub fn query_port(&self, port_num: u8) -> Result<PortAttributes, RdmaError> {
        #[cfg(feature = "stub-rdma")]
        {
            let _ = port_num;
            Err(RdmaError::StubMode)
        }

        #[cfg(not(feature = "stub-rdma"))]
        {
            let mut attr: ibv_port_attr = unsafe { std::mem::zeroed() };
            let ret = unsafe { ibv_query_port(self.context, port_num, &mut attr) };
            if ret != 0 {
                return Err(RdmaError::QueryPortFailed(port_num));
            }

            let gid_tbl_len = attr.gid_tbl_len;
            let (gid_index, gid) = find_roce_v2_gid(self.context, port_num, gid_tbl_len)?;

            Ok(PortAttributes {
                state: attr.state,
                lid: attr.lid,
                gid_index,
                gid,
            })
        }
    }

    pub fn register_memory(
        &self,
        addr: *mut u8,
        length: usize,
    ) -> Result<RdmaMemoryRegion, RdmaError> {
        #[cfg(feature = "stub-rdma")]
        {
            let _ = (addr, length);
            Err(RdmaError::StubMode)
        }

        #[cfg(not(feature = "stub-rdma"))]
        {
            debug!("registering memory: addr={:?}, len={}", addr, length);

            let access_flags =
                IBV_ACCESS_LOCAL_WRITE | IBV_ACCESS_REMOTE_READ | IBV_ACCESS_REMOTE_WRITE;

            let mr = unsafe {
                ibv_reg_mr(
                    self.pd,
                    addr as *mut libc::c_void,
                    length,
                    access_flags as i32,
                )
            };

            if mr.is_null() {
                return Err(RdmaError::RegisterMemoryFailed);
            }

            let lkey = unsafe { (*mr).lkey };
            let rkey = unsafe { (*mr).rkey };
            debug!("registered MR: lkey=0x{:x}, rkey=0x{:x}", lkey, rkey);

            Ok(RdmaMemoryRegion {
                mr,
                addr,
                length,
                lkey,
                rkey,
            })
        }
    }

    pub(crate) fn context(&self) -> *mut ibv_context {
        self.context
    }

    pub(crate) fn pd(&self) -> *mut ibv_pd {
        self.pd
    }

    pub fn name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for RdmaDevice {
    fn drop(&mut self) {
        #[cfg(not(feature = "stub-rdma"))]
        {
            if !self.pd.is_null() {
                unsafe { ibv_dealloc_pd(self.pd) };
            }
            if !self.context.is_null() {
                unsafe { ibv_close_device(self.context) };
            }
        }
    }
}

/// A registered memory region: `lkey` for local access, `rkey` handed to a
/// remote peer via `RDMA_EXCHANGE` / `CHECK_EXIST` responses.
pub struct RdmaMemoryRegion {
    #[allow(dead_code)]
    mr: *mut ibv_mr,
    pub addr: *mut u8,
    pub length: usize,
    pub lkey: u32,
    pub rkey: u32,
}

unsafe impl Send for RdmaMemoryRegion {}
unsafe impl Sync for RdmaMemoryRegion {}

impl Drop for RdmaMemoryRegion {
    fn drop(&mut self) {
        #[cfg(not(feature = "stub-rdma"))]
        {
            if !self.mr.is_null() {
                unsafe { ibv_dereg_mr(self.mr) };
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceAttributes {
    pub max_qp: i32,
    pub max_cq: i32,
    pub max_mr: i32,
    pub max_mr_size: u64,
}

#[derive(Debug, Clone)]
pub struct PortAttributes {
    pub state: u32,
    pub lid: u16,
    pub gid_index: u8,
    pub gid: [u8; 16],
}

/// Scans the port's GID table for an IPv4-mapped entry and returns its
/// index plus raw bytes. Upstream libibverbs doesn't expose
/// `ibv_find_sgid_type`, so we recognize RoCE v2/IPv4 the same way the
/// kernel does: a GID of the form `::ffff:a.b.c.d` (first 10 bytes zero,
/// next two `0xff`). The first matching non-zero entry wins.
#[cfg(not(feature = "stub-rdma"))]
fn find_roce_v2_gid(
    context: *mut ibv_context,
    port_num: u8,
    gid_tbl_len: i32,
) -> Result<(u8, [u8; 16]), RdmaError> {
    for index in 0..gid_tbl_len.max(0) {
        let mut gid: ibv_gid = unsafe { std::mem::zeroed() };
        let ret = unsafe { ibv_query_gid(context, port_num, index, &mut gid) };
        if ret != 0 {
            continue;
        }
        let raw = unsafe { gid.raw };
        if is_ipv4_mapped_gid(&raw) {
            return Ok((index as u8, raw));
        }
    }
    Err(RdmaError::NoRoceV2Gid(port_num))
}

pub fn is_ipv4_mapped_gid(gid: &[u8; 16]) -> bool {
    gid[0..10] == [0u8; 10] && gid[10] == 0xff && gid[11] == 0xff && gid[12..16] != [0u8; 4]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_mapped_gid_recognized() {
        let mut gid = [0u8; 16];
        gid[10] = 0xff;
        gid[11] = 0xff;
        gid[12..16].copy_from_slice(&[10, 0, 0, 5]);
        assert!(is_ipv4_mapped_gid(&gid));
    }

    #[test]
    fn all_zero_gid_rejected() {
        assert!(!is_ipv4_mapped_gid(&[0u8; 16]));
    }

    #[test]
    fn ipv6_gid_rejected() {
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        assert!(!is_ipv4_mapped_gid(&gid));
    }

    #[test]
    #[ignore] // requires RDMA hardware
    fn open_named_device() {
        let device = RdmaDevice::open("mlx5_0");
        if let Ok(dev) = device {
            assert!(!dev.name().is_empty());
        }
    }
}
