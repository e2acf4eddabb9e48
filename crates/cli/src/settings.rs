//! Optional JSON settings file for the CLI.
//!
//! Every section is optional:
//!
//! ```json
//! {
//!   "data_layer": { "page_size": 20, "cache": { "default_ttl_ms": 60000 } },
//!   "lifecycle":  { "stale_after_ms": 120000 },
//!   "audit":      { "burst_threshold": 10, "fields": { "title": "titre" } }
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use datalayer::{DataLayerConfig, LifecycleConfig};
use diagnostics::AuditConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_layer: DataLayerConfig,
    pub lifecycle: LifecycleConfig,
    pub audit: AuditConfig,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read settings file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid settings in {}", path.display()))
    }
}
