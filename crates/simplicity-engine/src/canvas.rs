//! Canvas observation state: the latest shared-canvas image reference and
//! the declared active-agent count.
//!
//! Both values are supplied by callers (the bridge that renders the canvas
//! declares how many agents it is serving); nothing here is derived. The
//! store keeps the liveness bookkeeping the orchestrator reads -- when the
//! canvas was last refreshed, when it was first refreshed, and how many
//! updates have arrived -- but the orchestrator, not this store, decides
//! what staleness implies.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::EngineError;

/// Data-URL prefix stripped from inbound image payloads.
const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Mutable state behind the mutex.
#[derive(Debug, Default)]
struct Inner {
    image: Option<String>,
    agents_count: u32,
    last_update: Option<Instant>,
    last_image_update: Option<Instant>,
    first_update: Option<Instant>,
    updates_count: u64,
}

/// Thread-safe singleton holding the canvas observation state.
#[derive(Debug, Default)]
pub struct CanvasObservationState {
    inner: Mutex<Inner>,
}

impl CanvasObservationState {
    /// Create an empty canvas state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the inner state, recovering from a poisoned mutex.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new canvas image reference (base64 PNG).
    ///
    /// A `data:image/png;base64,` prefix is stripped. Empty payloads and
    /// payloads containing non-base64 characters are rejected with
    /// [`EngineError::Input`].
    pub fn set_image(&self, reference: &str) -> Result<(), EngineError> {
        let image = reference.strip_prefix(DATA_URL_PREFIX).unwrap_or(reference);
        if image.is_empty() {
            return Err(EngineError::Input("empty image payload".to_owned()));
        }
        if !image.bytes().all(is_base64_byte) {
            return Err(EngineError::Input(
                "image payload is not valid base64".to_owned(),
            ));
        }

        let now = Instant::now();
        let mut inner = self.lock();
        inner.image = Some(image.to_owned());
        inner.last_image_update = Some(now);
        touch(&mut inner, now);
        debug!(image_bytes = image.len(), "canvas image updated");
        Ok(())
    }

    /// Set the declared number of active agents, clamped to be
    /// non-negative.
    pub fn set_agents_count(&self, n: i64) {
        let count = u32::try_from(n.max(0)).unwrap_or(u32::MAX);
        let now = Instant::now();
        let mut inner = self.lock();
        inner.agents_count = count;
        touch(&mut inner, now);
        debug!(agents_count = count, "declared agent count updated");
    }

    /// The declared active-agent count.
    pub fn agents_count(&self) -> u32 {
        self.lock().agents_count
    }

    /// A clone of the latest image reference, if any was ever set.
    pub fn image(&self) -> Option<String> {
        self.lock().image.clone()
    }

    /// Byte length of the latest image reference (0 when unset).
    pub fn image_len(&self) -> usize {
        self.lock().image.as_ref().map_or(0, String::len)
    }

    /// Total number of updates received (images and counts).
    pub fn updates_count(&self) -> u64 {
        self.lock().updates_count
    }

    /// Whether no update of any kind arrived within `timeout` of `now`.
    /// A never-updated state is stale.
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        self.lock()
            .last_update
            .is_none_or(|last| now.saturating_duration_since(last) > timeout)
    }

    /// Seconds since the latest image refresh, if an image was ever set.
    pub fn seconds_since_image(&self, now: Instant) -> Option<f64> {
        self.lock()
            .last_image_update
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
    }

    /// Seconds since the first update of any kind, if one has arrived.
    pub fn seconds_since_first_update(&self, now: Instant) -> Option<f64> {
        self.lock()
            .first_update
            .map(|first| now.saturating_duration_since(first).as_secs_f64())
    }

    /// Force the declared agent count to zero after the orchestrator
    /// judged the session disconnected.
    ///
    /// Deliberately does not refresh the liveness bookkeeping: a forced
    /// reset is not an update from the outside world.
    pub fn mark_disconnected(&self) {
        let mut inner = self.lock();
        if inner.agents_count > 0 {
            warn!(
                previous_count = inner.agents_count,
                "canvas judged disconnected, forcing agent count to zero"
            );
        }
        inner.agents_count = 0;
    }

    /// Clear all state. Exposed for test isolation.
    pub fn reset(&self) {
        *self.lock() = Inner::default();
    }
}

/// Refresh the liveness bookkeeping after an external update.
fn touch(inner: &mut Inner, now: Instant) {
    inner.last_update = Some(now);
    if inner.first_update.is_none() {
        inner.first_update = Some(now);
    }
    inner.updates_count = inner.updates_count.saturating_add(1);
}

/// Whether a byte belongs to the standard base64 alphabet.
const fn is_base64_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='
}
