//! Contribution store: the latest reported action per contributing agent.
//!
//! Ingestion handlers upsert concurrently from many short-lived tasks while
//! the orchestrator reads snapshots from its single loop, so every method
//! takes `&self` and serializes internally -- locking never leaks to
//! callers. The store is also the debounce primitive: the orchestrator asks
//! it whether the whole population has been quiet long enough to analyze.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use simplicity_types::{AgentId, ContributionRecord, ContributionUpdate, GridPos};
use tracing::{debug, info};

use crate::config::EvictionPolicy;

/// Synthetic strategy text for a heartbeat placeholder record.
const HEARTBEAT_STRATEGY: &str = "Heartbeat - agent alive";

/// Synthetic rationale text for a heartbeat placeholder record.
const HEARTBEAT_RATIONALE: &str = "Awaiting first action...";

/// One stored record plus its monotonic liveness clock.
#[derive(Debug, Clone)]
struct StoredContribution {
    record: ContributionRecord,
    last_seen: Instant,
}

/// Mutable store state behind the mutex.
#[derive(Debug, Default)]
struct Inner {
    records: HashMap<AgentId, StoredContribution>,
    last_update: Option<Instant>,
}

/// Thread-safe store of the latest contribution per agent.
#[derive(Debug)]
pub struct ContributionStore {
    inner: Mutex<Inner>,
    policy: EvictionPolicy,
}

impl ContributionStore {
    /// Create an empty store with the given eviction policy.
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy,
        }
    }

    /// Lock the inner state, recovering from a poisoned mutex.
    ///
    /// No invariant spans a panic point inside the critical sections, so
    /// the data is still consistent after poisoning.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert an agent's contribution.
    ///
    /// Heartbeats only refresh the timestamp of an existing record, or
    /// create a minimal placeholder when the agent is unknown (it may have
    /// been evicted). Real updates shift `predictions` into
    /// `previous_predictions` -- that shift happens exactly once per real
    /// update and never on heartbeats.
    pub fn update(&self, update: ContributionUpdate) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.last_update = Some(now);

        if update.is_heartbeat {
            let agent_id = update.agent_id.clone();
            match inner.records.entry(agent_id.clone()) {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    let stored = occupied.get_mut();
                    stored.record.timestamp = Utc::now();
                    stored.last_seen = now;
                    debug!(agent_id = %agent_id, "heartbeat refreshed");
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    vacant.insert(StoredContribution {
                        record: heartbeat_placeholder(update),
                        last_seen: now,
                    });
                    debug!(agent_id = %agent_id, "heartbeat created placeholder record");
                }
            }
            return;
        }

        let agent_id = update.agent_id.clone();
        let previous = inner.records.get(&agent_id).map(|s| s.record.clone());
        let (previous_iteration, previous_predictions) = previous
            .filter(|r| !r.is_heartbeat)
            .map_or((None, BTreeMap::new()), |r| {
                (Some(r.iteration), r.predictions)
            });

        inner.records.insert(
            agent_id.clone(),
            StoredContribution {
                record: ContributionRecord {
                    agent_id,
                    position: update.position,
                    iteration: update.iteration,
                    previous_iteration,
                    strategy: update.strategy,
                    rationale: update.rationale,
                    predictions: update.predictions,
                    previous_predictions,
                    pixels: update.pixels,
                    timestamp: Utc::now(),
                    is_heartbeat: false,
                },
                last_seen: now,
            },
        );
    }

    /// A snapshot copy of all current records, keyed by agent.
    ///
    /// Callers receive clones and cannot mutate store state through the
    /// returned map.
    pub fn all(&self) -> BTreeMap<AgentId, ContributionRecord> {
        self.lock()
            .records
            .iter()
            .map(|(id, stored)| (id.clone(), stored.record.clone()))
            .collect()
    }

    /// Positions of all currently-stored agents.
    pub fn active_positions(&self) -> BTreeMap<AgentId, GridPos> {
        self.lock()
            .records
            .iter()
            .map(|(id, stored)| (id.clone(), stored.record.position))
            .collect()
    }

    /// Number of agents currently stored.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Remove agents that have gone quiet beyond their adaptive timeout.
    ///
    /// The applicable timeout depends on how far the agent has progressed:
    /// settled agents (at least one completed cycle) get the long timeout,
    /// agents whose predictions await their first evaluation get the short
    /// timeout plus a grace window, and everyone else gets the short
    /// timeout. Eviction requires the age to be strictly greater than the
    /// timeout. Returns the number of evicted agents.
    pub fn evict_stale(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let policy = &self.policy;
        let stale: Vec<(AgentId, f64)> = inner
            .records
            .iter()
            .filter_map(|(id, stored)| {
                let age = now.saturating_duration_since(stored.last_seen);
                let timeout = applicable_timeout(&stored.record, policy);
                (age > timeout).then(|| (id.clone(), age.as_secs_f64()))
            })
            .collect();

        for (agent_id, age_secs) in &stale {
            inner.records.remove(agent_id);
            info!(
                agent_id = %agent_id,
                inactive_secs = *age_secs,
                "agent evicted (stale)"
            );
        }
        stale.len()
    }

    /// Whether no record has been touched for at least `delay`.
    ///
    /// Returns `(quiescent, seconds_since_last_update)`. An empty store is
    /// vacuously quiescent with elapsed `0.0`.
    pub fn all_quiescent(&self, delay: Duration) -> (bool, f64) {
        self.quiescent_at(delay, Instant::now())
    }

    /// Deterministic variant of [`Self::all_quiescent`] evaluated at a
    /// caller-supplied instant.
    pub fn quiescent_at(&self, delay: Duration, now: Instant) -> (bool, f64) {
        let inner = self.lock();
        if inner.records.is_empty() {
            return (true, 0.0);
        }
        match inner.last_update {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                (elapsed >= delay.as_secs_f64(), elapsed)
            }
            None => (true, 0.0),
        }
    }

    /// Seconds since the most recent update of any kind, or `None` when
    /// the store has never been updated.
    pub fn seconds_since_update(&self, now: Instant) -> Option<f64> {
        self.lock()
            .last_update
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
    }

    /// Whether the store has received no update for longer than `timeout`
    /// (a never-updated store counts as stale).
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        let inner = self.lock();
        inner
            .last_update
            .is_none_or(|last| now.saturating_duration_since(last) > timeout)
    }

    /// Clear all records. Exposed for test isolation.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.records.clear();
        inner.last_update = None;
    }
}

impl Default for ContributionStore {
    fn default() -> Self {
        Self::new(EvictionPolicy::default())
    }
}

/// Pick the eviction timeout applicable to a record's progress.
fn applicable_timeout(record: &ContributionRecord, policy: &EvictionPolicy) -> Duration {
    if record.has_settled() {
        policy.settled_timeout
    } else if record.awaiting_evaluation() {
        policy.fresh_timeout.saturating_add(policy.pending_grace)
    } else {
        policy.fresh_timeout
    }
}

/// Build the minimal placeholder record a heartbeat creates for an agent
/// the store no longer knows.
fn heartbeat_placeholder(update: ContributionUpdate) -> ContributionRecord {
    ContributionRecord {
        agent_id: update.agent_id,
        position: update.position,
        iteration: update.iteration,
        previous_iteration: None,
        strategy: HEARTBEAT_STRATEGY.to_owned(),
        rationale: HEARTBEAT_RATIONALE.to_owned(),
        predictions: BTreeMap::new(),
        previous_predictions: BTreeMap::new(),
        pixels: Vec::new(),
        timestamp: Utc::now(),
        is_heartbeat: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(agent: &str, iteration: u64, predictions: &[(&str, &str)]) -> ContributionUpdate {
        ContributionUpdate {
            agent_id: AgentId::new(agent),
            position: GridPos::new(1, 2),
            iteration,
            strategy: "spiral outward".to_owned(),
            rationale: "continue the arc".to_owned(),
            predictions: predictions
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            pixels: vec!["#ff0000@0,0".to_owned()],
            is_heartbeat: false,
        }
    }

    #[test]
    fn real_update_shifts_prediction_chain() {
        let store = ContributionStore::default();
        store.update(report("a", 1, &[("next", "red spiral")]));
        store.update(report("a", 2, &[("next", "blue ring")]));

        let records = store.all();
        let record = records.get(&AgentId::new("a"));
        assert!(record.is_some());
        if let Some(r) = record {
            assert_eq!(r.iteration, 2);
            assert_eq!(r.previous_iteration, Some(1));
            assert_eq!(
                r.previous_predictions.get("next").map(String::as_str),
                Some("red spiral")
            );
            assert_eq!(
                r.predictions.get("next").map(String::as_str),
                Some("blue ring")
            );
        }
    }

    #[test]
    fn heartbeat_never_alters_prediction_chain() {
        let store = ContributionStore::default();
        store.update(report("a", 1, &[("next", "red spiral")]));
        store.update(ContributionUpdate::heartbeat(AgentId::new("a")));

        let records = store.all();
        let record = records.get(&AgentId::new("a"));
        assert!(record.is_some());
        if let Some(r) = record {
            assert_eq!(r.iteration, 1);
            assert!(r.previous_predictions.is_empty());
            assert_eq!(
                r.predictions.get("next").map(String::as_str),
                Some("red spiral")
            );
            assert!(!r.is_heartbeat);
        }
    }

    #[test]
    fn heartbeat_creates_placeholder_for_unknown_agent() {
        let store = ContributionStore::default();
        store.update(ContributionUpdate::heartbeat(AgentId::new("ghost")));

        let records = store.all();
        let record = records.get(&AgentId::new("ghost"));
        assert!(record.is_some());
        if let Some(r) = record {
            assert!(r.is_heartbeat);
            assert_eq!(r.strategy, HEARTBEAT_STRATEGY);
            assert!(r.predictions.is_empty());
        }
    }

    #[test]
    fn at_most_one_record_per_agent() {
        let store = ContributionStore::default();
        store.update(report("a", 1, &[]));
        store.update(report("a", 2, &[]));
        store.update(ContributionUpdate::heartbeat(AgentId::new("a")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn eviction_boundary_is_strict() {
        let policy = EvictionPolicy::default();
        let fresh = policy.fresh_timeout;
        let store = ContributionStore::new(policy);
        store.update(report("a", 1, &[]));
        let now = Instant::now();

        // Exactly at the threshold: kept.
        assert_eq!(store.evict_stale(now + fresh), 0);
        assert_eq!(store.len(), 1);

        // Strictly beyond: evicted.
        assert_eq!(store.evict_stale(now + fresh + Duration::from_secs(1)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn unevaluated_predictions_earn_grace() {
        let policy = EvictionPolicy::default();
        let fresh = policy.fresh_timeout;
        let grace = policy.pending_grace;
        let store = ContributionStore::new(policy);
        // Has predictions, no previous_predictions: awaiting evaluation.
        store.update(report("a", 1, &[("next", "red spiral")]));
        let now = Instant::now();

        assert_eq!(store.evict_stale(now + fresh + Duration::from_secs(1)), 0);
        assert_eq!(
            store.evict_stale(now + fresh + grace + Duration::from_secs(1)),
            1
        );
    }

    #[test]
    fn settled_agents_get_long_timeout() {
        let policy = EvictionPolicy::default();
        let fresh = policy.fresh_timeout;
        let grace = policy.pending_grace;
        let settled = policy.settled_timeout;
        let store = ContributionStore::new(policy);
        store.update(report("a", 1, &[("next", "red spiral")]));
        store.update(report("a", 2, &[("next", "blue ring")]));
        let now = Instant::now();

        assert_eq!(
            store.evict_stale(now + fresh + grace + Duration::from_secs(1)),
            0
        );
        assert_eq!(
            store.evict_stale(now + settled + Duration::from_secs(1)),
            1
        );
    }

    #[test]
    fn empty_store_is_vacuously_quiescent() {
        let store = ContributionStore::default();
        let (quiet, elapsed) = store.all_quiescent(Duration::from_secs(5));
        assert!(quiet);
        assert!(elapsed.abs() < f64::EPSILON);
    }

    #[test]
    fn quiescence_follows_last_update() {
        let store = ContributionStore::default();
        store.update(report("a", 1, &[]));
        let now = Instant::now();

        let (quiet, elapsed) = store.quiescent_at(Duration::from_secs(5), now);
        assert!(!quiet);
        assert!(elapsed < 1.0);

        let (quiet, elapsed) =
            store.quiescent_at(Duration::from_secs(5), now + Duration::from_secs(6));
        assert!(quiet);
        assert!(elapsed >= 5.0);
    }

    #[test]
    fn heartbeat_counts_for_quiescence() {
        let store = ContributionStore::default();
        store.update(report("a", 1, &[]));
        let before = Instant::now();
        store.update(ContributionUpdate::heartbeat(AgentId::new("a")));
        let (quiet, _) = store.quiescent_at(Duration::from_secs(5), before);
        assert!(!quiet);
    }

    #[test]
    fn reset_clears_everything() {
        let store = ContributionStore::default();
        store.update(report("a", 1, &[]));
        store.reset();
        assert!(store.is_empty());
        let (quiet, elapsed) = store.all_quiescent(Duration::from_secs(5));
        assert!(quiet);
        assert!(elapsed.abs() < f64::EPSILON);
    }
}
