//! Runtime configuration loading
//!
//! One flat struct holds every tunable the runtime observes. Environment
//! overrides use the `STRAND_` prefix with upper-cased field names, e.g.
//! `STRAND_NUM_PES=8` or `STRAND_SCHEDULE=fifo`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ConfigError, Result};

/// Complete runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Total processing elements (CPU cores driven by workers)
    pub num_pes: u32,
    /// Worker threads per processing element
    pub threads_per_pe: u32,
    /// Stack size for device task execution, in bytes
    pub stack_size: u64,
    /// Pin worker threads to cores
    pub binding: bool,
    /// Yield the OS thread when a worker idles instead of spinning
    pub yield_: bool,
    /// Name of the schedule policy (`wsteal`, `fifo`)
    pub schedule: String,
    /// Name of the admission/throttle policy; observed by the submission
    /// glue, not the core
    pub throttle: String,
    /// Name of the barrier implementation
    pub barrier: String,
    /// Cap on in-flight plus prefetched tasks per accelerator worker
    pub num_prefetch: u32,
    /// Total scratch bytes for strided-transfer pack buffers
    pub pack_pool_bytes: u64,
    /// Initialize the cuBLAS handle on GPU worker startup
    pub cublas_init: bool,
    /// Run a warm-up device call on GPU worker startup
    pub gpu_warmup: bool,
    /// Overlap input transfers with kernel execution
    pub overlap_inputs: bool,
    /// Overlap output transfers with kernel execution
    pub overlap_outputs: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_pes: 4,
            threads_per_pe: 1,
            stack_size: 2 * 1024 * 1024,
            binding: false,
            yield_: true,
            schedule: "wsteal".to_string(),
            throttle: "none".to_string(),
            barrier: "centralized".to_string(),
            num_prefetch: 2,
            pack_pool_bytes: 16 * 1024 * 1024,
            cublas_init: false,
            gpu_warmup: true,
            overlap_inputs: true,
            overlap_outputs: true,
        }
    }
}

fn parse<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("cannot parse {value:?}"),
    })
}

fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("cannot parse {other:?} as bool"),
        }),
    }
}

impl RuntimeConfig {
    /// Defaults overridden by any `STRAND_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup (injectable for tests)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("STRAND_NUM_PES") {
            self.num_pes = parse("num_pes", &v)?;
        }
        if let Some(v) = lookup("STRAND_THREADS_PER_PE") {
            self.threads_per_pe = parse("threads_per_pe", &v)?;
        }
        if let Some(v) = lookup("STRAND_STACK_SIZE") {
            self.stack_size = parse("stack_size", &v)?;
        }
        if let Some(v) = lookup("STRAND_BINDING") {
            self.binding = parse_bool("binding", &v)?;
        }
        if let Some(v) = lookup("STRAND_YIELD") {
            self.yield_ = parse_bool("yield", &v)?;
        }
        if let Some(v) = lookup("STRAND_SCHEDULE") {
            self.schedule = v;
        }
        if let Some(v) = lookup("STRAND_THROTTLE") {
            self.throttle = v;
        }
        if let Some(v) = lookup("STRAND_BARRIER") {
            self.barrier = v;
        }
        if let Some(v) = lookup("STRAND_NUM_PREFETCH") {
            self.num_prefetch = parse("num_prefetch", &v)?;
        }
        if let Some(v) = lookup("STRAND_PACK_POOL_BYTES") {
            self.pack_pool_bytes = parse("pack_pool_bytes", &v)?;
        }
        if let Some(v) = lookup("STRAND_CUBLAS_INIT") {
            self.cublas_init = parse_bool("cublas_init", &v)?;
        }
        if let Some(v) = lookup("STRAND_GPU_WARMUP") {
            self.gpu_warmup = parse_bool("gpu_warmup", &v)?;
        }
        if let Some(v) = lookup("STRAND_OVERLAP_INPUTS") {
            self.overlap_inputs = parse_bool("overlap_inputs", &v)?;
        }
        if let Some(v) = lookup("STRAND_OVERLAP_OUTPUTS") {
            self.overlap_outputs = parse_bool("overlap_outputs", &v)?;
        }
        Ok(())
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.num_pes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_pes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.threads_per_pe == 0 {
            return Err(ConfigError::InvalidValue {
                field: "threads_per_pe".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.pack_pool_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pack_pool_bytes".to_string(),
                message: "must be nonzero".to_string(),
            });
        }
        if self.num_prefetch == 0 {
            warn!("num_prefetch is 0; accelerator workers will not overlap transfers");
        }
        Ok(())
    }

    /// Total worker count for the initial team, before accelerators
    #[must_use]
    pub fn cpu_workers(&self) -> u32 {
        self.num_pes * self.threads_per_pe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.schedule, "wsteal");
        assert_eq!(config.cpu_workers(), 4);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RuntimeConfig::default();
        config
            .apply_env(env(&[
                ("STRAND_NUM_PES", "8"),
                ("STRAND_THREADS_PER_PE", "2"),
                ("STRAND_SCHEDULE", "fifo"),
                ("STRAND_BINDING", "true"),
                ("STRAND_YIELD", "off"),
                ("STRAND_NUM_PREFETCH", "4"),
            ]))
            .unwrap();

        assert_eq!(config.num_pes, 8);
        assert_eq!(config.threads_per_pe, 2);
        assert_eq!(config.cpu_workers(), 16);
        assert_eq!(config.schedule, "fifo");
        assert!(config.binding);
        assert!(!config.yield_);
        assert_eq!(config.num_prefetch, 4);
    }

    #[test]
    fn test_bad_numeric_rejected() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_env(env(&[("STRAND_NUM_PES", "plenty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_bad_bool_rejected() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_env(env(&[("STRAND_BINDING", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_zero_workers_invalid() {
        let config = RuntimeConfig {
            num_pes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
