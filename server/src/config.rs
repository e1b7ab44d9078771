//! Process configuration: `{ service_port, device_name, prealloc_gib,
//! block_bytes }` plus a `worker_threads` knob for the blocking pool backing
//! the copy orchestrator's deferred drain-and-release tasks. Read from the
//! environment with documented defaults; no config file parser here.

use anyhow::{Context, Result};

const DEFAULT_SERVICE_PORT: u16 = 18_515;
const DEFAULT_DEVICE_NAME: &str = "mlx5_0";
const DEFAULT_PREALLOC_GIB: u32 = 4;
/// The reference implementation's default block size.
const DEFAULT_BLOCK_BYTES: u32 = 32 * 1024;
/// Size of the blocking-pool used for the one blocking step in the pipeline:
/// GPU stream drain + IPC handle release.
const DEFAULT_WORKER_THREADS: usize = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub service_port: u16,
    pub device_name: String,
    pub prealloc_gib: u32,
    pub block_bytes: u32,
    pub worker_threads: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            service_port: env_or("CACHE_SERVICE_PORT", DEFAULT_SERVICE_PORT)?,
            device_name: std::env::var("CACHE_DEVICE_NAME")
                .unwrap_or_else(|_| DEFAULT_DEVICE_NAME.to_string()),
            prealloc_gib: env_or("CACHE_PREALLOC_GIB", DEFAULT_PREALLOC_GIB)?,
            block_bytes: env_or("CACHE_BLOCK_BYTES", DEFAULT_BLOCK_BYTES)?,
            worker_threads: env_or("CACHE_WORKER_THREADS", DEFAULT_WORKER_THREADS)?,
        })
    }

    /// Total size of the pinned region the allocator carves into slabs.
    pub fn total_bytes(&self) -> usize {
        (self.prealloc_gib as usize) << 30
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e))
            .with_context(|| format!("parsing {}", key)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_bytes_is_gib_shifted() {
        let cfg = Config {
            service_port: 1,
            device_name: "x".into(),
            prealloc_gib: 2,
            block_bytes: 4096,
            worker_threads: DEFAULT_WORKER_THREADS,
        };
        assert_eq!(cfg.total_bytes(), 2usize << 30);
    }
}
