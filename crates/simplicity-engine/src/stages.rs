//! The two analysis-stage clients.
//!
//! Each stage is a templated-prompt call to the generative-analysis
//! collaborator followed by lenient JSON extraction and stage-specific
//! validation:
//!
//! - **Observation** consumes the canvas image and the active agent
//!   positions; produces structures and the description complexity `C_d`.
//!   A result in which one agent position belongs to two structures is
//!   invalid as a whole -- description-complexity accounting assumes a
//!   partition -- and burns a retry attempt.
//! - **Narration** consumes the observation result and all contribution
//!   records; produces the narrative, per-agent prediction errors, and the
//!   generative complexity `C_w`. Agents missing from the error map are
//!   backfilled with a zero error, since a first cycle has nothing to
//!   evaluate against.
//!
//! Both stages retry with linearly increasing delay before giving up for
//! the cycle; the orchestrator owns the fallback behavior on exhaustion.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use simplicity_types::{
    AgentId, ComplexityScore, ContributionRecord, GridPos, Narrative, PredictionError, Snapshot,
    Structure,
};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::EngineError;
use crate::llm::LlmBackend;
use crate::parse::parse_json_lenient;
use crate::prompt::{PromptEngine, format_positions, truncate_text};

/// Validated output of the observation stage.
#[derive(Debug, Clone)]
pub struct ObservationResult {
    /// Structures identified on the canvas.
    pub structures: Vec<Structure>,
    /// Description complexity of the whole canvas.
    pub c_d: ComplexityScore,
}

/// Validated output of the narration stage.
#[derive(Debug, Clone)]
pub struct NarrationResult {
    /// Narrative of the cycle.
    pub narrative: Narrative,
    /// Prediction errors for every active agent (backfilled).
    pub prediction_errors: BTreeMap<AgentId, PredictionError>,
    /// Generative complexity of the separate contributions.
    pub c_w: ComplexityScore,
}

/// Wire shape of an observation response.
#[derive(Debug, Deserialize)]
struct RawObservation {
    #[serde(default)]
    structures: Vec<Structure>,
    simplicity_assessment: RawObservationAssessment,
}

/// Wire shape of the observation assessment block.
#[derive(Debug, Deserialize)]
struct RawObservationAssessment {
    #[serde(rename = "C_d")]
    c_d: ComplexityScore,
}

/// Wire shape of a narration response.
#[derive(Debug, Deserialize)]
struct RawNarration {
    #[serde(default)]
    narrative: Narrative,
    /// Values are kept loose here: the collaborator sometimes emits
    /// `"N/A"` or bare numbers instead of the documented object shape.
    #[serde(default)]
    prediction_errors: BTreeMap<String, serde_json::Value>,
    simplicity_assessment: RawNarrationAssessment,
}

/// Wire shape of the narration assessment block.
#[derive(Debug, Deserialize)]
struct RawNarrationAssessment {
    #[serde(rename = "C_w")]
    c_w: ComplexityScore,
}

/// Check that no agent position belongs to more than one structure.
///
/// Returns the collision descriptions, one per offending position
/// occurrence; an empty list means the partition holds.
pub fn validate_structure_ownership(structures: &[Structure]) -> Vec<String> {
    let mut owner: BTreeMap<GridPos, usize> = BTreeMap::new();
    let mut collisions = Vec::new();

    for (idx, structure) in structures.iter().enumerate() {
        for pos in &structure.agent_positions {
            if let Some(first_idx) = owner.get(pos) {
                collisions.push(format!(
                    "position {pos} claimed by structures {first_idx} and {idx}"
                ));
            } else {
                owner.insert(*pos, idx);
            }
        }
    }

    collisions
}

/// Trimmed view of the previous snapshot injected for continuity.
fn continuity_digest(previous: Option<&Snapshot>) -> serde_json::Value {
    previous.map_or(serde_json::Value::Null, |snapshot| {
        serde_json::json!({
            "version": snapshot.version,
            "narrative": snapshot.narrative,
            "simplicity_assessment": snapshot.simplicity_assessment,
        })
    })
}

// ---------------------------------------------------------------------------
// Observation stage
// ---------------------------------------------------------------------------

/// Client for the observation stage.
pub struct ObservationStage {
    backend: Arc<LlmBackend>,
    prompts: Arc<PromptEngine>,
    retry: RetryConfig,
}

impl ObservationStage {
    /// Create an observation-stage client.
    pub const fn new(
        backend: Arc<LlmBackend>,
        prompts: Arc<PromptEngine>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            backend,
            prompts,
            retry,
        }
    }

    /// Run the observation stage with retries.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error once the retry budget is
    /// exhausted; the orchestrator decides the fallback.
    pub async fn run(
        &self,
        image: &str,
        agents_count: u32,
        positions: &[GridPos],
        previous: Option<&Snapshot>,
    ) -> Result<ObservationResult, EngineError> {
        let context = serde_json::json!({
            "agents_count": agents_count,
            "agent_positions": format_positions(positions),
            "previous_snapshot": continuity_digest(previous),
        });
        let prompt = self.prompts.render_observation(&context)?;
        info!(
            agents_count,
            image_bytes = image.len(),
            backend = self.backend.name(),
            "running observation stage"
        );

        let attempts = self.retry.attempts.max(1);
        let mut last_error = EngineError::Backend("observation: no attempts made".to_owned());
        for attempt in 1..=attempts {
            match self.attempt(&prompt, image).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(attempt, error = %e, "observation attempt failed");
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.base_delay.saturating_mul(attempt)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// One observation attempt: call, parse, validate.
    async fn attempt(&self, prompt: &str, image: &str) -> Result<ObservationResult, EngineError> {
        let response = self.backend.complete(prompt, Some(image)).await?;
        debug!(
            output_tokens = response.output_tokens,
            response_len = response.text.len(),
            "observation response received"
        );

        let value = parse_json_lenient(&response.text).ok_or_else(|| {
            EngineError::Parse("observation response contained no JSON object".to_owned())
        })?;
        let raw: RawObservation = serde_json::from_value(value)?;

        let collisions = validate_structure_ownership(&raw.structures);
        if !collisions.is_empty() {
            return Err(EngineError::Validation(format!(
                "overlapping structures: {}",
                collisions.join("; ")
            )));
        }

        Ok(ObservationResult {
            structures: raw.structures,
            c_d: raw.simplicity_assessment.c_d,
        })
    }
}

// ---------------------------------------------------------------------------
// Narration stage
// ---------------------------------------------------------------------------

/// Client for the narration stage.
pub struct NarrationStage {
    backend: Arc<LlmBackend>,
    prompts: Arc<PromptEngine>,
    retry: RetryConfig,
    truncate_len: usize,
}

impl NarrationStage {
    /// Create a narration-stage client. Free-text fields are truncated to
    /// `truncate_len` bytes before prompt injection to bound call cost.
    pub const fn new(
        backend: Arc<LlmBackend>,
        prompts: Arc<PromptEngine>,
        retry: RetryConfig,
        truncate_len: usize,
    ) -> Self {
        Self {
            backend,
            prompts,
            retry,
            truncate_len,
        }
    }

    /// Run the narration stage with retries.
    ///
    /// Agents present in `contributions` but absent from the returned
    /// error map are backfilled with a zero error.
    pub async fn run(
        &self,
        observation: &ObservationResult,
        contributions: &BTreeMap<AgentId, ContributionRecord>,
        previous: Option<&Snapshot>,
    ) -> Result<NarrationResult, EngineError> {
        let context = serde_json::json!({
            "observation": serde_json::json!({
                "structures": observation.structures,
                "simplicity_assessment": {"C_d": observation.c_d},
            }),
            "contributions": self.contribution_digest(contributions),
            "previous_snapshot": continuity_digest(previous),
        });
        let prompt = self.prompts.render_narration(&context)?;
        info!(
            agents = contributions.len(),
            backend = self.backend.name(),
            "running narration stage"
        );

        let attempts = self.retry.attempts.max(1);
        let mut last_error = EngineError::Backend("narration: no attempts made".to_owned());
        for attempt in 1..=attempts {
            match self.attempt(&prompt).await {
                Ok(raw) => return Ok(finalize_narration(raw, contributions)),
                Err(e) => {
                    warn!(attempt, error = %e, "narration attempt failed");
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.base_delay.saturating_mul(attempt)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// One narration attempt: call and parse.
    async fn attempt(&self, prompt: &str) -> Result<RawNarration, EngineError> {
        let response = self.backend.complete(prompt, None).await?;
        debug!(
            output_tokens = response.output_tokens,
            response_len = response.text.len(),
            "narration response received"
        );

        let value = parse_json_lenient(&response.text).ok_or_else(|| {
            EngineError::Parse("narration response contained no JSON object".to_owned())
        })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Per-agent digest injected into the narration prompt, with text
    /// fields truncated to bound external-call cost.
    fn contribution_digest(
        &self,
        contributions: &BTreeMap<AgentId, ContributionRecord>,
    ) -> serde_json::Value {
        let digest: BTreeMap<&AgentId, serde_json::Value> = contributions
            .iter()
            .map(|(agent_id, record)| {
                (
                    agent_id,
                    serde_json::json!({
                        "agent_id": record.agent_id,
                        "position": record.position,
                        "iteration": record.iteration,
                        "strategy": truncate_text(&record.strategy, self.truncate_len),
                        "rationale": truncate_text(&record.rationale, self.truncate_len),
                        "predictions": record.predictions,
                        "previous_predictions": record.previous_predictions,
                    }),
                )
            })
            .collect();
        serde_json::json!(digest)
    }
}

/// Convert a raw narration response into the validated result: coerce
/// loose error entries and backfill every active agent.
fn finalize_narration(
    raw: RawNarration,
    contributions: &BTreeMap<AgentId, ContributionRecord>,
) -> NarrationResult {
    let mut prediction_errors: BTreeMap<AgentId, PredictionError> = raw
        .prediction_errors
        .into_iter()
        .filter_map(|(agent_id, value)| {
            let error = value.get("error").and_then(serde_json::Value::as_f64)?;
            let explanation = value
                .get("explanation")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_owned();
            Some((AgentId::new(agent_id), PredictionError { error, explanation }))
        })
        .collect();

    for agent_id in contributions.keys() {
        if !prediction_errors.contains_key(agent_id) {
            debug!(agent_id = %agent_id, "backfilling missing prediction error");
            prediction_errors.insert(agent_id.clone(), PredictionError::unevaluated());
        }
    }

    NarrationResult {
        narrative: raw.narrative,
        prediction_errors,
        c_w: raw.simplicity_assessment.c_w,
    }
}
