//! The analysis orchestrator: one recurring control loop that decides when
//! enough agent activity exists to justify an analysis cycle, drives the
//! observation and narration stages with retries, and publishes complete,
//! monotonically versioned snapshots.
//!
//! Readiness is evaluated on a short polling tick:
//!
//! 1. Simultaneous canvas + contribution staleness means the session
//!    disconnected: force the agent count to zero and wait. Either signal
//!    alone can be legitimately delayed by a slow external call, so
//!    partial staleness never disconnects.
//! 2. No declared agents or no image: wait.
//! 3. Before the first snapshot, warm up: enough of the declared agents
//!    must have reported AND a minimum settling time must have passed --
//!    or an absolute timeout forces progress so a never-reporting agent
//!    cannot wedge the loop.
//! 4. Debounce: the contribution store must be quiescent and the image
//!    fresh (and not older than the newest contribution by more than a
//!    small tolerance) -- or an absolute wait timeout forces progress.
//! 5. Observation with retries; on exhaustion the previous snapshot is
//!    kept (or a pending placeholder is published when none exists).
//! 6. Narration with retries on freshly re-read contributions; on
//!    exhaustion the previous snapshot's narrative fields are reused.
//! 7. Combine, rank, publish version `previous + 1`, push to the metrics
//!    publisher fire-and-forget.
//!
//! Ingestion happens concurrently from short-lived handler tasks through
//! the thread-safe store methods exposed on this type; nothing here blocks
//! them while a stage call is in flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use simplicity_types::{
    AgentId, ComplexityScore, ContributionUpdate, Narrative, PredictionError,
    SimplicityAssessment, Snapshot,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::canvas::CanvasObservationState;
use crate::config::TimingConfig;
use crate::contributions::ContributionStore;
use crate::error::EngineError;
use crate::publisher::MetricsPublisher;
use crate::ranking::RankingEngine;
use crate::snapshot::{SnapshotDraft, SnapshotStore};
use crate::stages::{NarrationResult, NarrationStage, ObservationStage};

/// Default generative complexity when the very first narration fails and
/// there is nothing to reuse (canvas initialization plus basic seeds).
const FALLBACK_C_W: f64 = 15.0;

/// The observable outcome of one readiness tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// No declared agents, no image, or the session disconnected.
    NoAgents,
    /// Waiting for the initial population to report.
    Warmup,
    /// Waiting for quiescence and image freshness.
    ReadyWait,
    /// A stage failed for this cycle; the previous snapshot stands.
    StageFailed,
    /// A new snapshot was published with this version.
    Published(u64),
}

/// Loop-local scheduling state carried between ticks.
#[derive(Debug, Default)]
pub struct CycleState {
    /// When the current ready-wait period began, if one is in progress.
    ready_since: Option<Instant>,
}

/// The orchestration scheduler and state-aggregation engine.
pub struct AnalysisOrchestrator {
    contributions: Arc<ContributionStore>,
    canvas: Arc<CanvasObservationState>,
    snapshots: Arc<SnapshotStore>,
    ranking: Mutex<RankingEngine>,
    observation: ObservationStage,
    narration: NarrationStage,
    publisher: MetricsPublisher,
    timing: TimingConfig,
    /// Images smaller than this are seed noise, not a canvas worth
    /// analyzing.
    min_image_bytes: usize,
}

impl AnalysisOrchestrator {
    /// Create an orchestrator over the given stores and stage clients.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contributions: Arc<ContributionStore>,
        canvas: Arc<CanvasObservationState>,
        snapshots: Arc<SnapshotStore>,
        observation: ObservationStage,
        narration: NarrationStage,
        publisher: MetricsPublisher,
        timing: TimingConfig,
        min_image_bytes: usize,
    ) -> Self {
        Self {
            contributions,
            canvas,
            snapshots,
            ranking: Mutex::new(RankingEngine::new()),
            observation,
            narration,
            publisher,
            timing,
            min_image_bytes,
        }
    }

    /// Lock the ranking engine, recovering from a poisoned mutex.
    fn ranking(&self) -> MutexGuard<'_, RankingEngine> {
        self.ranking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------
    // Ingestion surface (called concurrently from handler tasks)
    // -----------------------------------------------------------------

    /// Record a contribution reported by an agent.
    ///
    /// An agent restarting its iteration counter (a real update with
    /// `iteration <= 1`) has its accumulated ranking history cleared so
    /// the cumulative average starts over with it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Input`] when the agent id is empty.
    pub fn report_contribution(&self, update: ContributionUpdate) -> Result<(), EngineError> {
        if update.agent_id.is_empty() {
            return Err(EngineError::Input("missing agent_id".to_owned()));
        }
        if !update.is_heartbeat && update.iteration <= 1 {
            self.ranking().reset_agent(&update.agent_id);
        }
        self.contributions.update(update);
        Ok(())
    }

    /// Store a new canvas image reference.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Input`] for empty or non-base64 payloads.
    pub fn set_canvas_image(&self, reference: &str) -> Result<(), EngineError> {
        self.canvas.set_image(reference)
    }

    /// Update the declared active-agent count (clamped to be
    /// non-negative).
    pub fn set_active_agent_count(&self, n: i64) {
        self.canvas.set_agents_count(n);
    }

    /// The latest snapshot, optionally personalized for one agent. A
    /// well-formed pending placeholder is returned before the first cycle.
    pub fn latest_snapshot(&self, agent_id: Option<&AgentId>) -> Snapshot {
        self.snapshots.latest_for(agent_id)
    }

    /// Clear all engine state. Exposed for test isolation.
    pub fn reset(&self) {
        self.contributions.reset();
        self.canvas.reset();
        self.snapshots.reset();
        self.ranking().reset();
    }

    // -----------------------------------------------------------------
    // Control loop
    // -----------------------------------------------------------------

    /// Run the orchestration loop forever on the configured polling tick.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.timing.poll_interval.as_millis(),
            "analysis orchestrator started"
        );
        let mut state = CycleState::default();
        let mut ticker = tokio::time::interval(self.timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let phase = self.run_cycle(&mut state).await;
            debug!(phase = ?phase, "tick evaluated");
        }
    }

    /// Evaluate one tick of the readiness state machine, running a full
    /// analysis cycle when the state is ready.
    ///
    /// Exposed separately from [`Self::run`] so scheduling decisions can
    /// be asserted without the timer loop.
    pub async fn run_cycle(&self, state: &mut CycleState) -> CyclePhase {
        let now = Instant::now();
        self.contributions.evict_stale(now);

        let previous = self.snapshots.latest();

        // Disconnection is only inferred from SIMULTANEOUS staleness of
        // both signals; either one alone may just be a slow external call.
        let disconnect_timeout = if previous.is_some() {
            self.timing.disconnect_steady
        } else {
            self.timing.disconnect_early
        };
        if self.canvas.is_stale(disconnect_timeout, now)
            && self.contributions.is_stale(disconnect_timeout, now)
        {
            self.canvas.mark_disconnected();
            state.ready_since = None;
            return CyclePhase::NoAgents;
        }

        let agents_count = self.canvas.agents_count();
        let Some(image) = self.canvas.image() else {
            state.ready_since = None;
            return CyclePhase::NoAgents;
        };
        if agents_count == 0 {
            state.ready_since = None;
            return CyclePhase::NoAgents;
        }

        // Warmup applies only until the first snapshot exists.
        let reported = self.contributions.len();
        if previous.is_none() && !self.warmed_up(agents_count, reported, now) {
            return CyclePhase::Warmup;
        }

        // Debounce: wait for the burst to settle, unless the absolute
        // wait timeout already forces progress with whatever we have.
        let ready_started = *state.ready_since.get_or_insert(now);
        let forced = now.saturating_duration_since(ready_started) >= self.timing.ready_wait_timeout;

        let quiescence = if previous.is_some() {
            self.timing.quiescence_steady
        } else {
            self.timing.quiescence_first
        };
        let (quiet, idle_secs) = self.contributions.quiescent_at(quiescence, now);
        let image_fresh = self.image_is_fresh(now);

        if !forced && !(quiet && image_fresh) {
            debug!(quiet, image_fresh, idle_secs, "waiting for quiescence");
            return CyclePhase::ReadyWait;
        }
        if image.len() < self.min_image_bytes {
            debug!(
                image_bytes = image.len(),
                "image too small to analyze, waiting"
            );
            return CyclePhase::ReadyWait;
        }

        if forced {
            warn!(
                waited_secs = self.timing.ready_wait_timeout.as_secs(),
                "ready-wait timeout reached, forcing analysis with current state"
            );
        }
        state.ready_since = None;

        self.analyze(&image, agents_count, previous).await
    }

    /// Whether the initial population has settled enough for the first
    /// cycle.
    fn warmed_up(&self, agents_count: u32, reported: usize, now: Instant) -> bool {
        let elapsed = self
            .canvas
            .seconds_since_first_update(now)
            .unwrap_or(0.0);
        if elapsed >= self.timing.warmup_timeout.as_secs_f64() {
            warn!(
                elapsed_secs = elapsed,
                reported, agents_count, "warmup timeout reached, forcing first cycle"
            );
            return true;
        }

        let min_reported = min_reported_count(agents_count, self.timing.warmup_min_ratio);
        let warmed = reported >= min_reported && elapsed >= self.timing.warmup_delay.as_secs_f64();
        if !warmed {
            debug!(
                elapsed_secs = elapsed,
                reported, min_reported, agents_count, "warming up"
            );
        }
        warmed
    }

    /// Whether the canvas image is recent enough to analyze: refreshed
    /// within the freshness window and no more than a small tolerance
    /// older than the newest contribution.
    fn image_is_fresh(&self, now: Instant) -> bool {
        let Some(image_age) = self.canvas.seconds_since_image(now) else {
            return false;
        };
        if image_age > self.timing.image_fresh_window.as_secs_f64() {
            return false;
        }
        match self.contributions.seconds_since_update(now) {
            Some(contribution_age) => {
                image_age <= contribution_age + self.timing.image_lag_tolerance.as_secs_f64()
            }
            None => true,
        }
    }

    /// Run one full observation -> narration -> combine -> publish cycle.
    async fn analyze(
        &self,
        image: &str,
        agents_count: u32,
        previous: Option<Snapshot>,
    ) -> CyclePhase {
        // Snapshot the active positions the observation result is
        // validated against.
        let positions: Vec<_> = self
            .contributions
            .active_positions()
            .values()
            .copied()
            .collect();
        info!(
            agents_count,
            reported = positions.len(),
            image_bytes = image.len(),
            "starting analysis cycle"
        );

        let observation = match self
            .observation
            .run(image, agents_count, &positions, previous.as_ref())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "observation stage failed, keeping previous snapshot");
                if previous.is_none() {
                    // Nothing to preserve: publish a minimal pending
                    // placeholder so queries stay well-formed.
                    let placeholder = self
                        .snapshots
                        .publish(SnapshotDraft::pending_placeholder(agents_count));
                    self.publisher.publish(&placeholder);
                }
                return CyclePhase::StageFailed;
            }
        };

        // Time has passed during the observation call: narrate over a
        // fresh read of the contribution store.
        let contributions = self.contributions.all();
        let narration = match self
            .narration
            .run(&observation, &contributions, previous.as_ref())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "narration stage failed, reusing previous narrative");
                narration_fallback(previous.as_ref(), &contributions)
            }
        };

        let assessment = SimplicityAssessment::combine(observation.c_d, narration.c_w);
        let rank_positions: std::collections::BTreeMap<_, _> = contributions
            .iter()
            .map(|(id, record)| (id.clone(), record.position))
            .collect();

        let next_version = self.snapshots.version().saturating_add(1);
        let agent_rankings = {
            let mut ranking = self.ranking();
            ranking.ingest(&narration.prediction_errors, next_version);
            ranking.rank(&rank_positions)
        };

        let snapshot = self.snapshots.publish(SnapshotDraft {
            structures: observation.structures,
            narrative: narration.narrative,
            prediction_errors: narration.prediction_errors,
            agent_rankings,
            simplicity_assessment: assessment,
            agents_count,
            pending: false,
        });
        self.publisher.publish(&snapshot);

        CyclePhase::Published(snapshot.version)
    }
}

/// Minimum number of reported agents required to leave warmup: exactly 1
/// when one agent is declared, otherwise a floor-2 fraction of the
/// declared count.
fn min_reported_count(agents_count: u32, ratio: f64) -> usize {
    if agents_count == 1 {
        return 1;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = (f64::from(agents_count) * ratio).floor() as usize;
    scaled.max(2)
}

/// Degraded narration result when the stage exhausts its retry budget:
/// reuse the previous snapshot's narrative fields, or first-cycle defaults
/// when there is nothing to reuse. Every active agent still gets an error
/// entry so downstream accounting stays total.
fn narration_fallback(
    previous: Option<&Snapshot>,
    contributions: &std::collections::BTreeMap<AgentId, simplicity_types::ContributionRecord>,
) -> NarrationResult {
    let (narrative, mut prediction_errors, c_w) = previous.map_or_else(
        || {
            (
                Narrative {
                    summary: "First narration pending. Agents are initializing their strategies."
                        .to_owned(),
                },
                std::collections::BTreeMap::new(),
                ComplexityScore::bare(FALLBACK_C_W),
            )
        },
        |snapshot| {
            (
                snapshot.narrative.clone(),
                snapshot.prediction_errors.clone(),
                snapshot.simplicity_assessment.c_w.clone(),
            )
        },
    );

    for agent_id in contributions.keys() {
        prediction_errors
            .entry(agent_id.clone())
            .or_insert_with(PredictionError::unevaluated);
    }

    NarrationResult {
        narrative,
        prediction_errors,
        c_w,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_reported_is_exact_for_single_agent() {
        assert_eq!(min_reported_count(1, 0.75), 1);
    }

    #[test]
    fn min_reported_has_floor_of_two() {
        assert_eq!(min_reported_count(2, 0.75), 2);
        assert_eq!(min_reported_count(3, 0.75), 2);
    }

    #[test]
    fn min_reported_scales_with_population() {
        assert_eq!(min_reported_count(4, 0.75), 3);
        assert_eq!(min_reported_count(8, 0.75), 6);
        assert_eq!(min_reported_count(100, 0.75), 75);
    }

    #[test]
    fn fallback_without_previous_uses_defaults() {
        let contributions = std::collections::BTreeMap::new();
        let result = narration_fallback(None, &contributions);
        assert!((result.c_w.value - FALLBACK_C_W).abs() < f64::EPSILON);
        assert!(result.narrative.summary.contains("pending"));
    }

    #[test]
    fn fallback_backfills_active_agents() {
        let mut snapshot = Snapshot::placeholder();
        snapshot.narrative.summary = "previous story".to_owned();
        let mut contributions = std::collections::BTreeMap::new();
        let update = ContributionUpdate {
            agent_id: AgentId::new("a"),
            position: simplicity_types::GridPos::new(0, 0),
            iteration: 1,
            strategy: String::new(),
            rationale: String::new(),
            predictions: std::collections::BTreeMap::new(),
            pixels: Vec::new(),
            is_heartbeat: false,
        };
        contributions.insert(
            AgentId::new("a"),
            simplicity_types::ContributionRecord {
                agent_id: update.agent_id,
                position: update.position,
                iteration: 1,
                previous_iteration: None,
                strategy: String::new(),
                rationale: String::new(),
                predictions: std::collections::BTreeMap::new(),
                previous_predictions: std::collections::BTreeMap::new(),
                pixels: Vec::new(),
                timestamp: chrono::Utc::now(),
                is_heartbeat: false,
            },
        );

        let result = narration_fallback(Some(&snapshot), &contributions);
        assert_eq!(result.narrative.summary, "previous story");
        assert!(result.prediction_errors.contains_key(&AgentId::new("a")));
    }
}
