//! Contribution payloads and store records.
//!
//! A contribution is one agent's reported action for the current cycle:
//! its strategy, rationale, self-predictions, and the pixels it drew.
//! Heartbeats are contributions with `is_heartbeat` set -- they only prove
//! the agent is alive and must not advance the prediction chain.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, GridPos};

/// Inbound contribution payload reported by an agent.
///
/// Everything except `agent_id` is optional on the wire: heartbeats carry
/// only the identifier and the flag, and early reports may omit predictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionUpdate {
    /// The reporting agent.
    pub agent_id: AgentId,
    /// The agent's cell position on the shared canvas.
    #[serde(default)]
    pub position: GridPos,
    /// The agent's own iteration counter (monotone per agent).
    #[serde(default)]
    pub iteration: u64,
    /// Short description of the strategy applied this cycle.
    #[serde(default)]
    pub strategy: String,
    /// Free-text rationale behind the action.
    #[serde(default)]
    pub rationale: String,
    /// Self-predictions for the next cycle, keyed by prediction name.
    #[serde(default)]
    pub predictions: BTreeMap<String, String>,
    /// Pixels drawn this cycle (opaque, used only for volume accounting).
    #[serde(default)]
    pub pixels: Vec<String>,
    /// When set, only liveness bookkeeping is updated.
    #[serde(default)]
    pub is_heartbeat: bool,
}

impl ContributionUpdate {
    /// Build a minimal heartbeat payload for an agent.
    pub fn heartbeat(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            position: GridPos::default(),
            iteration: 0,
            strategy: String::new(),
            rationale: String::new(),
            predictions: BTreeMap::new(),
            pixels: Vec::new(),
            is_heartbeat: true,
        }
    }
}

/// The latest known state of one contributing agent, owned by the
/// contribution store.
///
/// Invariants:
/// - at most one record exists per `agent_id`;
/// - `previous_predictions` is the prior cycle's `predictions`, shifted
///   forward exactly once per non-heartbeat update;
/// - heartbeats refresh `timestamp` without touching any other field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionRecord {
    /// The reporting agent.
    pub agent_id: AgentId,
    /// Stable cell position on the canvas.
    pub position: GridPos,
    /// Iteration counter of the most recent real update.
    pub iteration: u64,
    /// Iteration counter at the time of the prior real update, if any.
    pub previous_iteration: Option<u64>,
    /// Strategy text from the most recent real update.
    pub strategy: String,
    /// Rationale text from the most recent real update.
    pub rationale: String,
    /// Predictions from the most recent real update.
    pub predictions: BTreeMap<String, String>,
    /// Predictions from the update before that (the evaluation baseline).
    pub previous_predictions: BTreeMap<String, String>,
    /// Pixels drawn in the most recent real update.
    pub pixels: Vec<String>,
    /// When the agent was last heard from (heartbeats included).
    pub timestamp: DateTime<Utc>,
    /// True while this record is a heartbeat placeholder -- the agent is
    /// alive but has not yet reported a real action.
    pub is_heartbeat: bool,
}

impl ContributionRecord {
    /// Whether the agent has completed at least one full analysis cycle,
    /// i.e. its prediction chain has been shifted at least once.
    pub fn has_settled(&self) -> bool {
        !self.previous_predictions.is_empty()
    }

    /// Whether the agent has reported predictions that have not yet been
    /// evaluated against a following cycle.
    pub fn awaiting_evaluation(&self) -> bool {
        !self.predictions.is_empty() && self.previous_predictions.is_empty()
    }
}
