//! Orchestration scheduler and state-aggregation engine for the
//! collaborative-canvas simplicity metrics system.
//!
//! Many autonomous agents draw on a shared canvas and report their
//! actions, strategies, and self-predictions. This engine decides *when*
//! enough new activity exists to justify an analysis cycle, debounces
//! bursts, detects disconnected contributors, drives two external
//! generative-analysis stages (observation, then narration) with retries,
//! and merges their outputs into monotonically versioned snapshots with
//! cumulative per-agent prediction-accuracy rankings.
//!
//! # Architecture
//!
//! ```text
//! agents --> ContributionStore / CanvasObservationState (ingestion)
//!                      |
//!        AnalysisOrchestrator polls readiness
//!                      |
//!        ObservationStage --> NarrationStage          (external LLM calls)
//!                      |
//!        Snapshot assembly + RankingEngine
//!                      |
//!        SnapshotStore (queries) + MetricsPublisher (push)
//! ```
//!
//! State lives in memory for a single process; nothing here is durable
//! across restarts, and nothing here is fatal to the process -- every
//! failure path preserves the last known-good snapshot.

pub mod canvas;
pub mod config;
pub mod contributions;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod parse;
pub mod prompt;
pub mod publisher;
pub mod ranking;
pub mod snapshot;
pub mod stages;

pub use canvas::CanvasObservationState;
pub use config::{
    BackendConfig, BackendType, EngineConfig, EvictionPolicy, RetryConfig, TimingConfig,
};
pub use contributions::ContributionStore;
pub use error::EngineError;
pub use llm::{LlmBackend, LlmResponse, MockBackend, create_backend};
pub use orchestrator::{AnalysisOrchestrator, CyclePhase, CycleState};
pub use parse::parse_json_lenient;
pub use prompt::PromptEngine;
pub use publisher::MetricsPublisher;
pub use ranking::RankingEngine;
pub use snapshot::{SnapshotDraft, SnapshotStore};
pub use stages::{
    NarrationResult, NarrationStage, ObservationResult, ObservationStage,
    validate_structure_ownership,
};
