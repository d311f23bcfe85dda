//! Cumulative predictive-accuracy ranking of contributing agents.
//!
//! Each analysis cycle produces one prediction error per agent. The engine
//! keeps the full per-agent history keyed by cycle version -- a version map
//! rather than an append-only list, so delivering the same cycle twice can
//! never double-count -- and ranks the currently-active agents by their
//! mean error across all recorded cycles.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use simplicity_types::{AgentId, AgentRanking, GridPos, PredictionError};
use tracing::debug;

/// Per-agent prediction-error history and ranking computation.
#[derive(Debug, Default)]
pub struct RankingEngine {
    /// `agent -> cycle version -> error`.
    history: HashMap<AgentId, BTreeMap<u64, f64>>,
}

impl RankingEngine {
    /// Create an empty ranking engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one cycle's prediction errors.
    ///
    /// Idempotent per `(agent, cycle_version)`: re-delivery of a cycle
    /// leaves the first recorded value in place. Non-finite errors are
    /// ignored.
    pub fn ingest(
        &mut self,
        prediction_errors: &BTreeMap<AgentId, PredictionError>,
        cycle_version: u64,
    ) {
        for (agent_id, error) in prediction_errors {
            if !error.error.is_finite() {
                debug!(agent_id = %agent_id, "skipping non-finite prediction error");
                continue;
            }
            self.history
                .entry(agent_id.clone())
                .or_default()
                .entry(cycle_version)
                .or_insert(error.error);
        }
    }

    /// Rank the currently-active agents by mean error, ascending.
    ///
    /// Agents absent from `active_positions` are excluded (their history is
    /// retained for when they return); active agents with no recorded
    /// history are omitted. Ranks are dense from 1; equal means are broken
    /// by lexicographic agent id.
    pub fn rank(
        &self,
        active_positions: &BTreeMap<AgentId, GridPos>,
    ) -> BTreeMap<AgentId, AgentRanking> {
        let mut scored: Vec<(&AgentId, f64, usize)> = active_positions
            .keys()
            .filter_map(|agent_id| {
                let errors = self.history.get(agent_id)?;
                if errors.is_empty() {
                    return None;
                }
                let sum: f64 = errors.values().sum();
                #[allow(clippy::cast_precision_loss)]
                let avg = sum / errors.len() as f64;
                Some((agent_id, avg, errors.len()))
            })
            .collect();

        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        scored
            .into_iter()
            .enumerate()
            .filter_map(|(idx, (agent_id, avg_error, cycles))| {
                let rank = u32::try_from(idx.saturating_add(1)).ok()?;
                let position = *active_positions.get(agent_id)?;
                Some((
                    agent_id.clone(),
                    AgentRanking {
                        rank,
                        avg_error,
                        total_iterations: u32::try_from(cycles).unwrap_or(u32::MAX),
                        position,
                    },
                ))
            })
            .collect()
    }

    /// Drop one agent's accumulated history (used when the agent restarts
    /// its iteration counter).
    pub fn reset_agent(&mut self, agent_id: &AgentId) {
        if self.history.remove(agent_id).is_some() {
            debug!(agent_id = %agent_id, "ranking history reset");
        }
    }

    /// Number of cycles recorded for an agent.
    pub fn cycles_recorded(&self, agent_id: &AgentId) -> usize {
        self.history.get(agent_id).map_or(0, BTreeMap::len)
    }

    /// Clear all history. Exposed for test isolation.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors(entries: &[(&str, f64)]) -> BTreeMap<AgentId, PredictionError> {
        entries
            .iter()
            .map(|(id, e)| {
                (
                    AgentId::new(*id),
                    PredictionError {
                        error: *e,
                        explanation: "judged".to_owned(),
                    },
                )
            })
            .collect()
    }

    fn positions(ids: &[&str]) -> BTreeMap<AgentId, GridPos> {
        ids.iter()
            .map(|id| (AgentId::new(*id), GridPos::new(0, 0)))
            .collect()
    }

    #[test]
    fn means_and_ranks_follow_history() {
        let mut engine = RankingEngine::new();
        engine.ingest(&errors(&[("a", 0.1), ("b", 0.5)]), 1);
        engine.ingest(&errors(&[("a", 0.3)]), 2);

        let rankings = engine.rank(&positions(&["a", "b"]));
        let a = rankings.get(&AgentId::new("a"));
        let b = rankings.get(&AgentId::new("b"));
        assert!(a.is_some_and(|r| r.rank == 1 && (r.avg_error - 0.2).abs() < 1e-9));
        assert!(b.is_some_and(|r| r.rank == 2 && (r.avg_error - 0.5).abs() < 1e-9));
        assert!(a.is_some_and(|r| r.total_iterations == 2));
        assert!(b.is_some_and(|r| r.total_iterations == 1));
    }

    #[test]
    fn reingest_of_same_cycle_is_idempotent() {
        let mut engine = RankingEngine::new();
        engine.ingest(&errors(&[("a", 0.1)]), 1);
        engine.ingest(&errors(&[("a", 0.9)]), 1);

        assert_eq!(engine.cycles_recorded(&AgentId::new("a")), 1);
        let rankings = engine.rank(&positions(&["a"]));
        let a = rankings.get(&AgentId::new("a"));
        assert!(a.is_some_and(|r| (r.avg_error - 0.1).abs() < 1e-9));
    }

    #[test]
    fn inactive_agents_are_excluded_but_retained() {
        let mut engine = RankingEngine::new();
        engine.ingest(&errors(&[("a", 0.1), ("b", 0.5)]), 1);

        let rankings = engine.rank(&positions(&["a"]));
        assert_eq!(rankings.len(), 1);
        assert!(rankings.contains_key(&AgentId::new("a")));

        // B's history survives its absence.
        assert_eq!(engine.cycles_recorded(&AgentId::new("b")), 1);
        let rankings = engine.rank(&positions(&["a", "b"]));
        assert_eq!(rankings.len(), 2);
    }

    #[test]
    fn ties_break_lexicographically() {
        let mut engine = RankingEngine::new();
        engine.ingest(&errors(&[("zed", 0.3), ("abe", 0.3)]), 1);

        let rankings = engine.rank(&positions(&["zed", "abe"]));
        assert!(rankings
            .get(&AgentId::new("abe"))
            .is_some_and(|r| r.rank == 1));
        assert!(rankings
            .get(&AgentId::new("zed"))
            .is_some_and(|r| r.rank == 2));
    }

    #[test]
    fn agents_without_history_are_omitted() {
        let engine = RankingEngine::new();
        let rankings = engine.rank(&positions(&["a"]));
        assert!(rankings.is_empty());
    }

    #[test]
    fn reset_agent_clears_only_that_agent() {
        let mut engine = RankingEngine::new();
        engine.ingest(&errors(&[("a", 0.1), ("b", 0.5)]), 1);
        engine.reset_agent(&AgentId::new("a"));
        assert_eq!(engine.cycles_recorded(&AgentId::new("a")), 0);
        assert_eq!(engine.cycles_recorded(&AgentId::new("b")), 1);
    }
}
