//! Tuning knobs for the data layer.
//!
//! Every threshold is a constructor parameter so tests can shrink or
//! stretch it.  All sections deserialize from JSON with every field
//! optional; durations are written in milliseconds.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use store::IN_FILTER_CEILING;

/// Serialize a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod duration_ms_map {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(m: &HashMap<String, Duration>, s: S) -> Result<S::Ok, S::Error> {
        let millis: HashMap<&String, u64> = m
            .iter()
            .map(|(k, v)| (k, u64::try_from(v.as_millis()).unwrap_or(u64::MAX)))
            .collect();
        millis.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<HashMap<String, Duration>, D::Error> {
        let millis = HashMap::<String, u64>::deserialize(d)?;
        Ok(millis
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Per-collection time-to-live policy for the reference cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for collections without an explicit entry.
    #[serde(rename = "default_ttl_ms", with = "duration_ms")]
    pub default_ttl: Duration,
    #[serde(rename = "collection_ttls_ms", with = "duration_ms_map")]
    pub collection_ttls: HashMap<String, Duration>,
}

impl CacheConfig {
    /// TTL to apply to entries of `collection`.
    pub fn ttl_for(&self, collection: &str) -> Duration {
        self.collection_ttls
            .get(collection)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    pub fn with_ttl(mut self, collection: impl Into<String>, ttl: Duration) -> Self {
        self.collection_ttls.insert(collection.into(), ttl);
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60;
        let collection_ttls = [
            ("concerts", MINUTE),
            ("form_submissions", 30),
            ("venues", 5 * MINUTE),
            ("contacts", 5 * MINUTE),
            ("artists", 5 * MINUTE),
            ("structures", 10 * MINUTE),
            ("settings", 30 * MINUTE),
            ("templates", 30 * MINUTE),
        ]
        .into_iter()
        .map(|(name, secs)| (name.to_owned(), Duration::from_secs(secs)))
        .collect();

        Self {
            default_ttl: Duration::from_secs(2 * MINUTE),
            collection_ttls,
        }
    }
}

// ---------------------------------------------------------------------------
// Data layer
// ---------------------------------------------------------------------------

/// Configuration shared by the resolver, paginator, secondary loader and
/// list orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLayerConfig {
    /// Maximum ids per "value in set" query.
    pub batch_ceiling: usize,
    /// Default page size for list screens.
    pub page_size: usize,
    /// Minimum interval between two full (page-1) reloads.
    #[serde(rename = "refresh_cooldown_ms", with = "duration_ms")]
    pub refresh_cooldown: Duration,
    pub cache: CacheConfig,
}

impl DataLayerConfig {
    /// The batch ceiling clamped to what the store accepts.
    pub fn effective_batch_ceiling(&self) -> usize {
        self.batch_ceiling.clamp(1, IN_FILTER_CEILING)
    }
}

impl Default for DataLayerConfig {
    fn default() -> Self {
        Self {
            batch_ceiling: IN_FILTER_CEILING,
            page_size: 10,
            refresh_cooldown: Duration::from_secs(10),
            cache: CacheConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle registry
// ---------------------------------------------------------------------------

/// Thresholds for consumer staleness and health scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// No metadata update for longer than this marks an instance stale.
    #[serde(rename = "stale_after_ms", with = "duration_ms")]
    pub stale_after: Duration,
    /// Alive for longer than this marks an instance long-running.
    #[serde(rename = "long_running_after_ms", with = "duration_ms")]
    pub long_running_after: Duration,
    /// Instance count above which a small penalty applies.
    pub soft_ceiling: usize,
    /// Instance count above which a larger penalty applies.
    pub hard_ceiling: usize,
    /// Points taken off the health score.
    pub penalties: HealthPenalties,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            long_running_after: Duration::from_secs(30 * 60),
            soft_ceiling: 50,
            hard_ceiling: 100,
            penalties: HealthPenalties::default(),
        }
    }
}

/// Health score penalty weights.  Severity weights apply per hotspot, the
/// others once per report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPenalties {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    /// Above `soft_ceiling` instances.
    pub soft_ceiling: u32,
    /// Above `hard_ceiling` instances; replaces the soft one.
    pub hard_ceiling: u32,
    /// At least one high-severity hotspot.
    pub high_presence: u32,
}

impl Default for HealthPenalties {
    fn default() -> Self {
        Self {
            high: 10,
            medium: 5,
            low: 2,
            soft_ceiling: 10,
            hard_ceiling: 20,
            high_presence: 25,
        }
    }
}
