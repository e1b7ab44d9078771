//! Process-wide shared state: the RDMA device/PD, the pinned slab pool, and
//! the cache index are all process-global and mutated only from the event
//! loop thread.

use crate::config::Config;
use cache::CacheIndex;
use gpu::GpuRuntime;
use psa::SlabPool;
use rdma::RdmaDevice;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub device: Arc<RdmaDevice>,
    pub pool: Arc<SlabPool>,
    pub cache: Arc<CacheIndex>,
    pub gpu: Arc<dyn GpuRuntime>,
}
