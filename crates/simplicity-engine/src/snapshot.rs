//! Snapshot store: the single place versions are assigned.
//!
//! A snapshot is only ever replaced by a *complete* new snapshot; partial
//! stage failures never write through this store. Versions increase by
//! exactly one per publish on the single orchestrator task, so version
//! order is also wall-clock publish order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use simplicity_types::{
    AgentId, AgentRanking, Narrative, PredictionError, SimplicityAssessment, Snapshot, Structure,
};
use tracing::info;

/// The assembled-but-unversioned content of one analysis cycle.
#[derive(Debug, Clone)]
pub struct SnapshotDraft {
    /// Structures from the observation stage.
    pub structures: Vec<Structure>,
    /// Narrative from the narration stage (possibly reused).
    pub narrative: Narrative,
    /// Per-agent prediction errors.
    pub prediction_errors: BTreeMap<AgentId, PredictionError>,
    /// Cumulative rankings of active agents.
    pub agent_rankings: BTreeMap<AgentId, AgentRanking>,
    /// Combined simplicity metrics.
    pub simplicity_assessment: SimplicityAssessment,
    /// Declared active-agent count at assembly time.
    pub agents_count: u32,
    /// True only for the minimal placeholder published when the very
    /// first observation fails outright.
    pub pending: bool,
}

impl SnapshotDraft {
    /// The minimal pending draft published when no snapshot exists yet and
    /// the first observation stage could not complete.
    pub fn pending_placeholder(agents_count: u32) -> Self {
        let base = Snapshot::placeholder();
        Self {
            structures: base.structures,
            narrative: base.narrative,
            prediction_errors: base.prediction_errors,
            agent_rankings: base.agent_rankings,
            simplicity_assessment: base.simplicity_assessment,
            agents_count,
            pending: true,
        }
    }
}

/// Mutable state behind the mutex.
#[derive(Debug, Default)]
struct Inner {
    latest: Option<Snapshot>,
    version: u64,
}

/// Thread-safe owner of the latest published snapshot.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    inner: Mutex<Inner>,
}

impl SnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the inner state, recovering from a poisoned mutex.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a complete draft as the next snapshot version.
    ///
    /// Returns the published snapshot (version assigned, timestamped).
    pub fn publish(&self, draft: SnapshotDraft) -> Snapshot {
        let mut inner = self.lock();
        let version = inner.version.saturating_add(1);
        inner.version = version;

        let snapshot = Snapshot {
            version,
            timestamp: Utc::now(),
            structures: draft.structures,
            narrative: draft.narrative,
            prediction_errors: draft.prediction_errors,
            agent_rankings: draft.agent_rankings,
            simplicity_assessment: draft.simplicity_assessment,
            agents_count: draft.agents_count,
            pending: draft.pending,
        };
        inner.latest = Some(snapshot.clone());
        info!(
            version,
            structures = snapshot.structures.len(),
            u = snapshot.simplicity_assessment.u.value,
            interpretation = %snapshot.simplicity_assessment.u.interpretation,
            pending = snapshot.pending,
            "snapshot published"
        );
        snapshot
    }

    /// The latest published snapshot, if any.
    pub fn latest(&self) -> Option<Snapshot> {
        self.lock().latest.clone()
    }

    /// The latest snapshot, or the well-formed pending placeholder when
    /// nothing has been published.
    pub fn latest_or_placeholder(&self) -> Snapshot {
        self.lock()
            .latest
            .clone()
            .unwrap_or_else(Snapshot::placeholder)
    }

    /// Query entry point: the full snapshot, or a personalized view when
    /// an agent id is given.
    pub fn latest_for(&self, agent_id: Option<&AgentId>) -> Snapshot {
        let snapshot = self.latest_or_placeholder();
        match agent_id {
            Some(id) => snapshot.personalized(id),
            None => snapshot,
        }
    }

    /// The current version counter (0 before the first publish).
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Clear all state. Exposed for test isolation.
    pub fn reset(&self) {
        *self.lock() = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> SnapshotDraft {
        SnapshotDraft {
            structures: Vec::new(),
            narrative: Narrative {
                summary: "quiet cycle".to_owned(),
            },
            prediction_errors: BTreeMap::new(),
            agent_rankings: BTreeMap::new(),
            simplicity_assessment: SimplicityAssessment::pending(),
            agents_count: 3,
            pending: false,
        }
    }

    #[test]
    fn versions_increase_by_one() {
        let store = SnapshotStore::new();
        assert_eq!(store.version(), 0);
        let first = store.publish(draft());
        let second = store.publish(draft());
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn empty_store_serves_placeholder() {
        let store = SnapshotStore::new();
        assert!(store.latest().is_none());
        let snapshot = store.latest_for(None);
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.pending);
    }

    #[test]
    fn personalized_query_restricts_to_agent() {
        let store = SnapshotStore::new();
        let mut d = draft();
        d.prediction_errors.insert(
            AgentId::new("a"),
            PredictionError {
                error: 0.5,
                explanation: "halfway".to_owned(),
            },
        );
        store.publish(d);

        let view = store.latest_for(Some(&AgentId::new("a")));
        assert_eq!(view.prediction_errors.len(), 1);
        let view = store.latest_for(Some(&AgentId::new("other")));
        assert!(view
            .prediction_errors
            .get(&AgentId::new("other"))
            .is_some_and(|e| e.error.abs() < f64::EPSILON));
    }

    #[test]
    fn pending_placeholder_draft_consumes_a_version() {
        let store = SnapshotStore::new();
        let published = store.publish(SnapshotDraft::pending_placeholder(2));
        assert_eq!(published.version, 1);
        assert!(published.pending);
        assert_eq!(published.agents_count, 2);
    }
}
