//! Snapshot publisher: best-effort push of published snapshots to the
//! metrics channel.
//!
//! Publishing is fire-and-forget over NATS: serialization happens inline,
//! the network publish runs on a spawned task, and every failure is logged
//! and swallowed. Snapshot correctness and the query interface never
//! depend on the publisher being reachable -- the NATS client keeps
//! reconnecting with backoff on its own.

use simplicity_types::Snapshot;
use tracing::{info, warn};

use crate::error::EngineError;

/// Subject prefix for published snapshots; the version is appended.
const SNAPSHOT_SUBJECT_PREFIX: &str = "simplicity.snapshots";

/// Best-effort snapshot publisher.
pub enum MetricsPublisher {
    /// Publish snapshots to a NATS subject.
    Nats(async_nats::Client),
    /// Publishing disabled (no metrics endpoint configured, or tests).
    Noop,
}

impl MetricsPublisher {
    /// Connect to a NATS server.
    ///
    /// The connection is retried on initial connect and automatically
    /// re-established on drops, so a publisher that starts before its
    /// metrics server still comes up.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Backend`] only for immediately-fatal
    /// connection setup problems (e.g. an unparseable URL).
    pub async fn connect(url: &str) -> Result<Self, EngineError> {
        info!(url, "connecting metrics publisher");
        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect(url)
            .await
            .map_err(|e| EngineError::Backend(format!("metrics connect failed: {e}")))?;
        Ok(Self::Nats(client))
    }

    /// A publisher that discards everything.
    pub const fn disabled() -> Self {
        Self::Noop
    }

    /// Push a snapshot to the metrics channel (fire-and-forget).
    ///
    /// Failures are logged and never propagate to the orchestrator loop.
    pub fn publish(&self, snapshot: &Snapshot) {
        let Self::Nats(client) = self else {
            return;
        };

        let subject = format!("{SNAPSHOT_SUBJECT_PREFIX}.{}", snapshot.version);
        match serde_json::to_vec(snapshot) {
            Ok(payload) => {
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                        warn!(
                            subject = subject,
                            error = %e,
                            "failed to publish snapshot"
                        );
                    }
                });
            }
            Err(e) => {
                warn!(
                    subject = subject,
                    error = %e,
                    "failed to serialize snapshot for publishing"
                );
            }
        }
    }
}

impl std::fmt::Debug for MetricsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Nats(_) => "nats",
            Self::Noop => "noop",
        };
        f.debug_struct("MetricsPublisher").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simplicity_types::Snapshot;

    #[tokio::test]
    async fn disabled_publisher_swallows_snapshots() {
        let publisher = MetricsPublisher::disabled();
        // Must not panic, block, or require a runtime connection.
        publisher.publish(&Snapshot::placeholder());
    }

    // Publishing against a live NATS server is covered manually; the
    // orchestrator tests run with the disabled publisher.
    #[tokio::test]
    #[ignore = "requires a live NATS server"]
    async fn connect_to_nats() {
        let publisher = MetricsPublisher::connect("nats://localhost:4222").await;
        assert!(publisher.is_ok());
    }
}
