//! Device configuration
//!
//! A [`DeviceConfig`] picks the backend, the device ordinal and the memory
//! flags used by [`crate::DeviceContext::alloc`]. It can be built in code,
//! deserialized with serde, parsed from JSON, or read from the environment.
//!
//! # Environment Variables
//!
//! - `DEVCACHE_BACKEND` - `host` (default), `cuda` or `auto`
//! - `DEVCACHE_DEVICE` - device ordinal, default `0`
//! - `DEVCACHE_MEM_FLAGS` - `read_write` (default), `read_only` or `write_only`

use crate::error::{Error, Result};
use devcache_backends::{ComputeApi, HostBackend, MemFlags};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

pub const BACKEND_ENV: &str = "DEVCACHE_BACKEND";
pub const DEVICE_ENV: &str = "DEVCACHE_DEVICE";
pub const MEM_FLAGS_ENV: &str = "DEVCACHE_MEM_FLAGS";

/// Which compute backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host reference backend (always available)
    #[default]
    Host,
    /// NVIDIA GPU (requires the `cuda` feature)
    Cuda,
    /// CUDA when a device opens, otherwise host
    Auto,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "host" | "cpu" => Some(Self::Host),
            "cuda" | "gpu" => Some(Self::Cuda),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::Cuda => "cuda",
            Self::Auto => "auto",
        })
    }
}

/// Configuration for opening a [`crate::DeviceContext`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub device_ordinal: usize,
    /// Flags for buffers allocated through [`crate::DeviceContext::alloc`]
    pub default_flags: MemFlags,
}

impl DeviceConfig {
    /// Host backend with default settings
    pub fn host() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_default_flags(mut self, flags: MemFlags) -> Self {
        self.default_flags = flags;
        self
    }

    /// Read the configuration from `DEVCACHE_*` environment variables
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a variable is set to an unrecognized value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = env::var(BACKEND_ENV) {
            config.backend = BackendKind::parse(&value)
                .ok_or_else(|| Error::Config(format!("{BACKEND_ENV}: unknown backend '{value}'")))?;
        }
        if let Ok(value) = env::var(DEVICE_ENV) {
            config.device_ordinal = value
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{DEVICE_ENV}: invalid ordinal '{value}': {e}")))?;
        }
        if let Ok(value) = env::var(MEM_FLAGS_ENV) {
            config.default_flags = MemFlags::parse(&value)
                .ok_or_else(|| Error::Config(format!("{MEM_FLAGS_ENV}: unknown flags '{value}'")))?;
        }

        Ok(config)
    }

    /// Parse a JSON document such as `{"backend": "auto", "device_ordinal": 1}`
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Construct the backend named by [`Self::backend`]
    ///
    /// `Auto` is resolved by [`crate::DeviceContext::from_config`], which needs
    /// to open a context to know whether CUDA works; here it yields CUDA when
    /// compiled in and host otherwise.
    pub fn create_backend(&self) -> Result<Box<dyn ComputeApi + Send>> {
        match self.backend {
            BackendKind::Host => Ok(Box::new(HostBackend::new())),
            BackendKind::Cuda => self.create_cuda_backend(),
            BackendKind::Auto => self
                .create_cuda_backend()
                .or_else(|_| Ok(Box::new(HostBackend::new()) as Box<dyn ComputeApi + Send>)),
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn create_cuda_backend(&self) -> Result<Box<dyn ComputeApi + Send>> {
        Ok(Box::new(devcache_backends::CudaBackend::new(self.device_ordinal)))
    }

    #[cfg(not(feature = "cuda"))]
    pub(crate) fn create_cuda_backend(&self) -> Result<Box<dyn ComputeApi + Send>> {
        Err(Error::Config(
            "CUDA backend requested but devcache was built without the `cuda` feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialises the tests that touch process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn reset_env() {
        for key in [BACKEND_ENV, DEVICE_ENV, MEM_FLAGS_ENV] {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_to_host() {
        let config = DeviceConfig::default();
        assert_eq!(config.backend, BackendKind::Host);
        assert_eq!(config.device_ordinal, 0);
        assert_eq!(config.default_flags, MemFlags::ReadWrite);
    }

    #[test]
    fn parses_json() {
        let config =
            DeviceConfig::from_json_str(r#"{"backend": "auto", "device_ordinal": 2, "default_flags": "read_only"}"#)
                .unwrap();
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.device_ordinal, 2);
        assert_eq!(config.default_flags, MemFlags::ReadOnly);

        let partial = DeviceConfig::from_json_str(r#"{"backend": "cuda"}"#).unwrap();
        assert_eq!(partial.device_ordinal, 0);
    }

    #[test]
    fn rejects_unknown_json_fields() {
        let err = DeviceConfig::from_json_str(r#"{"backend": "host", "queue_depth": 4}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(DeviceConfig::from_json_str(r#"{"backend": "opencl"}"#).is_err());
    }

    #[test]
    fn reads_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        reset_env();

        env::set_var(BACKEND_ENV, "AUTO");
        env::set_var(DEVICE_ENV, " 1 ");
        env::set_var(MEM_FLAGS_ENV, "write_only");
        let config = DeviceConfig::from_env().unwrap();
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.device_ordinal, 1);
        assert_eq!(config.default_flags, MemFlags::WriteOnly);

        reset_env();
    }

    #[test]
    fn bad_environment_values_are_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        reset_env();

        env::set_var(DEVICE_ENV, "first");
        assert!(matches!(DeviceConfig::from_env(), Err(Error::Config(_))));
        reset_env();

        env::set_var(BACKEND_ENV, "vulkan");
        assert!(matches!(DeviceConfig::from_env(), Err(Error::Config(_))));
        reset_env();
    }

    #[test]
    fn host_backend_is_always_available() {
        let backend = DeviceConfig::host().create_backend().unwrap();
        assert_eq!(backend.name(), "host");
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn cuda_without_feature_is_a_config_error() {
        let config = DeviceConfig::host().with_backend(BackendKind::Cuda);
        assert!(matches!(config.create_backend(), Err(Error::Config(_))));

        let auto = DeviceConfig::host().with_backend(BackendKind::Auto);
        assert_eq!(auto.create_backend().unwrap().name(), "host");
    }
}
