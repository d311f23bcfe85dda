//! Shared type definitions for the simplicity metrics workspace.
//!
//! This crate is the single source of truth for the data model that flows
//! between contributing agents, the analysis engine, and the metrics
//! publisher.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe wrappers for agent identifiers and grid positions
//! - [`contribution`] -- Per-agent contribution payloads and records
//! - [`snapshot`] -- Versioned analysis snapshots and derived metrics

pub mod contribution;
pub mod ids;
pub mod snapshot;

// Re-export all public types at crate root for convenience.
pub use contribution::{ContributionRecord, ContributionUpdate};
pub use ids::{AgentId, GridPos};
pub use snapshot::{
    AgentRanking, ComplexityScore, EmergenceBand, EmergenceScore, Narrative, PredictionError,
    SimplicityAssessment, Snapshot, Structure,
};
