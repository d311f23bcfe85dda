//! Versioned analysis snapshots and derived simplicity metrics.
//!
//! A [`Snapshot`] is the immutable combination of one observation pass
//! (structures + description complexity `C_d`), one narration pass
//! (narrative + generative complexity `C_w` + per-agent prediction errors),
//! and the cumulative agent rankings derived from those errors. Versions
//! increase by exactly one per successful publish and never regress.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, GridPos};

/// Default explanation attached to a backfilled prediction error.
pub const NO_PRIOR_PREDICTION: &str = "no prior prediction";

/// A visual structure identified on the canvas by the observation pass.
///
/// Opaque to the engine beyond its `agent_positions`, which must partition
/// the active agents: no position may belong to two structures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Structure {
    /// Short name assigned by the observer.
    #[serde(default)]
    pub name: String,
    /// Free-text description of the structure.
    #[serde(default)]
    pub description: String,
    /// Canvas positions of the agents contributing to this structure.
    #[serde(default)]
    pub agent_positions: Vec<GridPos>,
}

/// A single complexity score reported by an analysis pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplexityScore {
    /// The score in bits.
    #[serde(default)]
    pub value: f64,
    /// Optional reasoning supplied alongside the score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ComplexityScore {
    /// Build a score with no accompanying description.
    pub const fn bare(value: f64) -> Self {
        Self {
            value,
            description: None,
        }
    }
}

/// Ordinal interpretation band for the emergence indicator `U`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmergenceBand {
    /// `U < 0`: description is costlier than generation.
    #[serde(rename = "NO_EMERGENCE")]
    None,
    /// `0 <= U < 6`.
    #[serde(rename = "WEAK_EMERGENCE")]
    Weak,
    /// `6 <= U < 11`.
    #[serde(rename = "MODERATE_EMERGENCE")]
    Moderate,
    /// `11 <= U < 16`.
    #[serde(rename = "STRONG_EMERGENCE")]
    Strong,
    /// `U >= 16`.
    #[serde(rename = "EXCEPTIONAL_EMERGENCE")]
    Exceptional,
}

impl EmergenceBand {
    /// Classify an emergence value `U = C_w - C_d` into its band.
    ///
    /// Cutoffs are tuned policy, not load-bearing architecture.
    pub fn classify(u: f64) -> Self {
        if u < 0.0 {
            Self::None
        } else if u < 6.0 {
            Self::Weak
        } else if u < 11.0 {
            Self::Moderate
        } else if u < 16.0 {
            Self::Strong
        } else {
            Self::Exceptional
        }
    }

    /// Wire name of the band, as published to dashboards.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NO_EMERGENCE",
            Self::Weak => "WEAK_EMERGENCE",
            Self::Moderate => "MODERATE_EMERGENCE",
            Self::Strong => "STRONG_EMERGENCE",
            Self::Exceptional => "EXCEPTIONAL_EMERGENCE",
        }
    }
}

impl core::fmt::Display for EmergenceBand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The emergence indicator with its interpretation band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergenceScore {
    /// `U = C_w - C_d`.
    pub value: f64,
    /// Ordinal interpretation of the value.
    pub interpretation: EmergenceBand,
}

/// Combined simplicity assessment from both analysis passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimplicityAssessment {
    /// Description complexity from the observation pass.
    #[serde(rename = "C_d")]
    pub c_d: ComplexityScore,
    /// Generative complexity from the narration pass.
    #[serde(rename = "C_w")]
    pub c_w: ComplexityScore,
    /// Emergence indicator derived from the two scores.
    #[serde(rename = "U")]
    pub u: EmergenceScore,
}

impl SimplicityAssessment {
    /// Combine the two stage scores into a full assessment,
    /// deriving `U = C_w - C_d` and its band.
    pub fn combine(c_d: ComplexityScore, c_w: ComplexityScore) -> Self {
        let u = c_w.value - c_d.value;
        Self {
            c_d,
            c_w,
            u: EmergenceScore {
                value: u,
                interpretation: EmergenceBand::classify(u),
            },
        }
    }

    /// The zeroed assessment used by placeholder snapshots.
    pub fn pending() -> Self {
        Self::combine(ComplexityScore::bare(0.0), ComplexityScore::bare(0.0))
    }
}

/// Narrative produced by the narration pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Narrative {
    /// Summary of how the canvas evolved this cycle.
    #[serde(default)]
    pub summary: String,
}

/// One agent's prediction error for a cycle, as judged by the narration
/// pass against the agent's prior predictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionError {
    /// Error in `[0, 1]`: 0 = perfect prediction, 1 = completely wrong.
    pub error: f64,
    /// Free-text justification of the score.
    pub explanation: String,
}

impl PredictionError {
    /// The backfill value for an agent with nothing to evaluate yet.
    pub fn unevaluated() -> Self {
        Self {
            error: 0.0,
            explanation: NO_PRIOR_PREDICTION.to_owned(),
        }
    }
}

/// One agent's entry in the cumulative predictive-accuracy ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRanking {
    /// Dense rank, 1 = best predictor.
    pub rank: u32,
    /// Mean prediction error across all recorded cycles.
    pub avg_error: f64,
    /// Number of cycles contributing to the mean.
    pub total_iterations: u32,
    /// The agent's canvas position.
    pub position: GridPos,
}

/// The immutable, versioned combination of both analysis passes plus
/// derived rankings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Strictly increasing publish counter (0 only for placeholders).
    pub version: u64,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Structures identified by the observation pass.
    pub structures: Vec<Structure>,
    /// Narrative from the narration pass.
    pub narrative: Narrative,
    /// Per-agent prediction errors for this cycle.
    pub prediction_errors: BTreeMap<AgentId, PredictionError>,
    /// Cumulative predictive-accuracy rankings of active agents.
    pub agent_rankings: BTreeMap<AgentId, AgentRanking>,
    /// Combined simplicity metrics.
    pub simplicity_assessment: SimplicityAssessment,
    /// Declared number of active agents at publish time.
    pub agents_count: u32,
    /// True for the well-formed placeholder served before (or instead of)
    /// the first successful analysis cycle.
    #[serde(default)]
    pub pending: bool,
}

impl Snapshot {
    /// The well-formed placeholder returned while no cycle has completed.
    pub fn placeholder() -> Self {
        Self {
            version: 0,
            timestamp: Utc::now(),
            structures: Vec::new(),
            narrative: Narrative {
                summary: "Awaiting first analysis cycle...".to_owned(),
            },
            prediction_errors: BTreeMap::new(),
            agent_rankings: BTreeMap::new(),
            simplicity_assessment: SimplicityAssessment::pending(),
            agents_count: 0,
            pending: true,
        }
    }

    /// Personalized view for one agent: `prediction_errors` and
    /// `agent_rankings` are restricted to that agent, with a default
    /// filler error when the agent has no entry yet.
    pub fn personalized(&self, agent_id: &AgentId) -> Self {
        let error = self
            .prediction_errors
            .get(agent_id)
            .cloned()
            .unwrap_or_else(PredictionError::unevaluated);
        let mut prediction_errors = BTreeMap::new();
        prediction_errors.insert(agent_id.clone(), error);

        let mut agent_rankings = BTreeMap::new();
        if let Some(ranking) = self.agent_rankings.get(agent_id) {
            agent_rankings.insert(agent_id.clone(), ranking.clone());
        }

        Self {
            prediction_errors,
            agent_rankings,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_cutoffs() {
        assert_eq!(EmergenceBand::classify(-0.1), EmergenceBand::None);
        assert_eq!(EmergenceBand::classify(0.0), EmergenceBand::Weak);
        assert_eq!(EmergenceBand::classify(5.9), EmergenceBand::Weak);
        assert_eq!(EmergenceBand::classify(6.0), EmergenceBand::Moderate);
        assert_eq!(EmergenceBand::classify(11.0), EmergenceBand::Strong);
        assert_eq!(EmergenceBand::classify(16.0), EmergenceBand::Exceptional);
    }

    #[test]
    fn band_serializes_to_wire_names() {
        let json = serde_json::to_string(&EmergenceBand::Moderate).unwrap_or_default();
        assert_eq!(json, "\"MODERATE_EMERGENCE\"");
    }

    #[test]
    fn assessment_combines_u() {
        let assessment =
            SimplicityAssessment::combine(ComplexityScore::bare(10.0), ComplexityScore::bare(22.0));
        assert!((assessment.u.value - 12.0).abs() < f64::EPSILON);
        assert_eq!(assessment.u.interpretation, EmergenceBand::Strong);
    }

    #[test]
    fn assessment_uses_wire_field_names() {
        let assessment =
            SimplicityAssessment::combine(ComplexityScore::bare(1.0), ComplexityScore::bare(2.0));
        let json = serde_json::to_value(&assessment).unwrap_or_default();
        assert!(json.get("C_d").is_some());
        assert!(json.get("C_w").is_some());
        assert!(json.get("U").is_some());
    }

    #[test]
    fn placeholder_is_pending_version_zero() {
        let snapshot = Snapshot::placeholder();
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.pending);
        assert!(snapshot.structures.is_empty());
    }

    #[test]
    fn personalized_restricts_and_backfills() {
        let mut snapshot = Snapshot::placeholder();
        snapshot.prediction_errors.insert(
            AgentId::new("a"),
            PredictionError {
                error: 0.4,
                explanation: "missed the spiral".to_owned(),
            },
        );
        snapshot.agent_rankings.insert(
            AgentId::new("a"),
            AgentRanking {
                rank: 1,
                avg_error: 0.4,
                total_iterations: 1,
                position: GridPos::new(0, 0),
            },
        );

        let for_a = snapshot.personalized(&AgentId::new("a"));
        assert_eq!(for_a.prediction_errors.len(), 1);
        assert_eq!(for_a.agent_rankings.len(), 1);

        let for_b = snapshot.personalized(&AgentId::new("b"));
        assert_eq!(for_b.prediction_errors.len(), 1);
        let entry = for_b.prediction_errors.get(&AgentId::new("b"));
        assert!(entry.is_some_and(|e| e.error.abs() < f64::EPSILON));
        assert!(for_b.agent_rankings.is_empty());
    }
}
