//! Registry of live data consumers.
//!
//! Every screen or subscription that reads through the data layer registers
//! itself and is expected to unregister when torn down.  Consumers are not
//! reliable about that, so the registry exposes staleness and long-running
//! heuristics plus a health score to catch leaks before they pile up.
//!
//! # Health scoring
//!
//! The score starts at 100 and loses:
//! - per instance that is stale *and* long-running (high severity): 10
//! - per instance that is only stale (medium): 5
//! - per instance that is only long-running (low): 2
//! - more than `soft_ceiling` instances: 10, more than `hard_ceiling`: 20
//! - at least one high-severity instance: 25
//!
//! and is clamped to `0..=100`.  The report is a pure function of the
//! registry contents and the clock reading.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{elapsed, Clock, SystemClock};
use crate::config::LifecycleConfig;

// ---------------------------------------------------------------------------
// Records and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerRecord {
    pub instance_id: String,
    pub entity_type: String,
    /// 1-based sequence number per entity type.
    pub instance_number: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hotspot {
    pub instance_id: String,
    pub entity_type: String,
    pub instance_number: u64,
    pub severity: Severity,
    pub age: Duration,
    pub inactive_for: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => HealthStatus::Excellent,
            75..=89 => HealthStatus::Good,
            50..=74 => HealthStatus::Fair,
            25..=49 => HealthStatus::Poor,
            _ => HealthStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_entity_type: BTreeMap<String, usize>,
    pub stale: usize,
    pub long_running: usize,
    pub oldest_age: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub score: u32,
    pub status: HealthStatus,
    pub stats: RegistryStats,
    /// Most severe first.
    pub hotspots: Vec<Hotspot>,
    pub recommendations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryState {
    instances: HashMap<String, ConsumerRecord>,
    counters: HashMap<String, u64>,
}

pub struct ConsumerLifecycleRegistry {
    state: Mutex<RegistryState>,
    config: LifecycleConfig,
    clock: Arc<dyn Clock>,
}

impl ConsumerLifecycleRegistry {
    pub fn new(config: LifecycleConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            config,
            clock,
        }
    }

    pub fn with_system_clock(config: LifecycleConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer and return its instance id.
    pub fn register(&self, entity_type: &str, metadata: Map<String, Value>) -> String {
        let now = self.clock.now();
        let mut state = self.state();
        let counter = state.counters.entry(entity_type.to_owned()).or_insert(0);
        *counter += 1;
        let instance_number = *counter;
        let instance_id = format!("{entity_type}-{instance_number}-{}", Uuid::new_v4().simple());

        state.instances.insert(
            instance_id.clone(),
            ConsumerRecord {
                instance_id: instance_id.clone(),
                entity_type: entity_type.to_owned(),
                instance_number,
                created_at: now,
                last_updated: now,
                metadata,
            },
        );
        debug!(instance_id = %instance_id, total = state.instances.len(), "consumer registered");
        instance_id
    }

    /// Returns `false` when the id is unknown (already unregistered).
    pub fn unregister(&self, instance_id: &str) -> bool {
        let removed = self.state().instances.remove(instance_id).is_some();
        if removed {
            debug!(instance_id, "consumer unregistered");
        } else {
            warn!(instance_id, "unregister of unknown consumer");
        }
        removed
    }

    /// Merge `patch` into the instance metadata and refresh `last_updated`.
    /// Returns `false` when the id is unknown.
    pub fn update_metadata(&self, instance_id: &str, patch: Map<String, Value>) -> bool {
        let now = self.clock.now();
        let mut state = self.state();
        match state.instances.get_mut(instance_id) {
            Some(record) => {
                record.metadata.extend(patch);
                record.last_updated = now;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<ConsumerRecord> {
        self.state().instances.get(instance_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every instance inactive for longer than `max_inactive`.
    /// Returns the removed ids, sorted.
    pub fn cleanup_stale(&self, max_inactive: Duration) -> Vec<String> {
        let now = self.clock.now();
        let mut state = self.state();
        let mut removed: Vec<String> = state
            .instances
            .values()
            .filter(|r| elapsed(r.last_updated, now) > max_inactive)
            .map(|r| r.instance_id.clone())
            .collect();
        for id in &removed {
            state.instances.remove(id);
        }
        removed.sort();
        if !removed.is_empty() {
            info!(removed = removed.len(), remaining = state.instances.len(), "stale consumers cleaned up");
        }
        removed
    }

    /// Drop every instance and every per-type counter.
    pub fn reset(&self) {
        *self.state() = RegistryState::default();
    }

    fn classify(&self, record: &ConsumerRecord, now: DateTime<Utc>) -> (bool, bool) {
        let stale = elapsed(record.last_updated, now) > self.config.stale_after;
        let long_running = elapsed(record.created_at, now) > self.config.long_running_after;
        (stale, long_running)
    }

    pub fn get_stats(&self) -> RegistryStats {
        let now = self.clock.now();
        let state = self.state();
        self.stats_of(&state, now)
    }

    fn stats_of(&self, state: &RegistryState, now: DateTime<Utc>) -> RegistryStats {
        let mut by_entity_type = BTreeMap::new();
        let (mut stale, mut long_running) = (0, 0);
        for record in state.instances.values() {
            *by_entity_type.entry(record.entity_type.clone()).or_insert(0) += 1;
            let (is_stale, is_long) = self.classify(record, now);
            stale += usize::from(is_stale);
            long_running += usize::from(is_long);
        }
        RegistryStats {
            total: state.instances.len(),
            by_entity_type,
            stale,
            long_running,
            oldest_age: state
                .instances
                .values()
                .map(|r| elapsed(r.created_at, now))
                .max(),
        }
    }

    pub fn get_health_report(&self) -> HealthReport {
        let now = self.clock.now();
        let state = self.state();
        let stats = self.stats_of(&state, now);

        let mut hotspots: Vec<Hotspot> = state
            .instances
            .values()
            .filter_map(|record| {
                let severity = match self.classify(record, now) {
                    (true, true) => Severity::High,
                    (true, false) => Severity::Medium,
                    (false, true) => Severity::Low,
                    (false, false) => return None,
                };
                Some(Hotspot {
                    instance_id: record.instance_id.clone(),
                    entity_type: record.entity_type.clone(),
                    instance_number: record.instance_number,
                    severity,
                    age: elapsed(record.created_at, now),
                    inactive_for: elapsed(record.last_updated, now),
                })
            })
            .collect();
        drop(state);

        hotspots.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.inactive_for.cmp(&a.inactive_for))
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });

        let count = |sev: Severity| hotspots.iter().filter(|h| h.severity == sev).count() as u32;
        let (high, medium, low) = (count(Severity::High), count(Severity::Medium), count(Severity::Low));

        let weights = &self.config.penalties;
        let mut penalty = high
            .saturating_mul(weights.high)
            .saturating_add(medium.saturating_mul(weights.medium))
            .saturating_add(low.saturating_mul(weights.low));
        if stats.total > self.config.hard_ceiling {
            penalty = penalty.saturating_add(weights.hard_ceiling);
        } else if stats.total > self.config.soft_ceiling {
            penalty = penalty.saturating_add(weights.soft_ceiling);
        }
        if high > 0 {
            penalty = penalty.saturating_add(weights.high_presence);
        }
        let score = 100u32.saturating_sub(penalty);

        let mut recommendations = Vec::new();
        if high > 0 {
            recommendations.push(format!(
                "{high} consumer(s) are stale and long-running: likely missing unregister on teardown"
            ));
        }
        if medium > 0 {
            recommendations.push(format!(
                "{medium} consumer(s) have not updated in over {}s: run cleanup_stale",
                self.config.stale_after.as_secs()
            ));
        }
        if stats.total > self.config.soft_ceiling {
            recommendations.push(format!(
                "{} live consumers exceed the ceiling of {}: check for re-subscription loops",
                stats.total, self.config.soft_ceiling
            ));
        }

        HealthReport {
            score,
            status: HealthStatus::from_score(score),
            stats,
            hotspots,
            recommendations,
        }
    }
}
