//! Runtime configuration: adapter-id spoofing and debug name overrides.
//!
//! Layered `Default -> file -> environment`, environment variables prefixed
//! `DXMTL_` (e.g. `DXMTL_ADAPTER_VENDOR_ID=0x106b`), in the style DXVK reads
//! its own environment overrides.

use ::config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// PCI vendor id reported to the application in place of Apple's own.
    #[serde(default)]
    pub adapter_vendor_id: Option<u32>,

    /// PCI device id reported to the application.
    #[serde(default)]
    pub adapter_device_id: Option<u32>,

    /// Adapter description string override.
    #[serde(default)]
    pub adapter_description: Option<String>,

    /// Capacity of the pipeline descriptor cache before LRU eviction kicks in.
    #[serde(default = "default_pipeline_cache_capacity")]
    pub pipeline_cache_capacity: usize,

    /// Number of chunks the command queue keeps in flight at once.
    #[serde(default = "default_chunk_ring_capacity")]
    pub chunk_ring_capacity: usize,
}

fn default_pipeline_cache_capacity() -> usize {
    512
}

fn default_chunk_ring_capacity() -> usize {
    3
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            adapter_vendor_id: None,
            adapter_device_id: None,
            adapter_description: None,
            pipeline_cache_capacity: default_pipeline_cache_capacity(),
            chunk_ring_capacity: default_chunk_ring_capacity(),
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from an optional config file (`dxmtl.toml` in the
    /// current directory if present) layered under `DXMTL_*` environment
    /// variables, falling back to `RuntimeConfig::default()` for anything
    /// neither source sets.
    pub fn load() -> RuntimeConfig {
        let builder = Config::builder()
            .add_source(File::with_name("dxmtl").required(false))
            .add_source(Environment::with_prefix("DXMTL"));

        match builder.build() {
            Ok(cfg) => cfg.try_deserialize().unwrap_or_else(|e| {
                log::warn!("invalid dxmtl configuration, using defaults: {}", e);
                RuntimeConfig::default()
            }),
            Err(e) => {
                log::warn!("failed to build dxmtl configuration, using defaults: {}", e);
                RuntimeConfig::default()
            }
        }
    }
}
