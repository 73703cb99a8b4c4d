//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```rust
//! use trellis_core::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_json(r#"{ "max_update_depth": 32 }"#).unwrap();
//! assert_eq!(config.max_update_depth, 32);
//! assert_eq!(config.boundary.max_retries, 3);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Settings for a [`Runtime`](crate::reactive::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of nested notifications a single write may cause
    /// before it fails with `Error::CascadeOverflow`.
    pub max_update_depth: usize,

    /// Defaults used by `ErrorBoundary::from_config`.
    pub boundary: BoundaryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_update_depth: 100,
            boundary: BoundaryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }
}

/// Retry policy defaults for error boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    pub retry: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            retry: true,
            max_retries: 3,
            retry_delay_ms: 0,
        }
    }
}

impl BoundaryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
