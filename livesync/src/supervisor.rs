//! Reconnection supervision: capped exponential backoff and stream
//! re-acquisition.
//!
//! A dropped stream is never surfaced to observers as an error; the
//! collection worker retries indefinitely through [`Backoff`] and observers
//! see only a subscription-state transition. Each successful re-attach is
//! followed by a full listing that the reconciler replays as synthetic
//! events, so the snapshot converges without duplicate-apply even when
//! live events overlap the listing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::document::{CollectionName, Document, DocumentId};
use crate::store::{RemoteStore, StoreError, StreamEvent, StreamHandle};

/// Capped exponential backoff with jitter.
///
/// Delay doubles per attempt from `base` up to `cap`, then a random factor
/// in [0.5, 1.5) is applied so many subscriptions dropped by one outage do
/// not reconnect in lockstep. Entropy comes from a freshly generated UUID;
/// good enough for jitter and keeps the dependency set flat.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay to sleep before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let doubled = self.base.saturating_mul(1u32 << shift);
        let capped = doubled.min(self.cap);
        let jittered = capped.mul_f64(0.5 + jitter_unit());
        jittered.min(self.cap)
    }

    /// Forget accumulated attempts after a successful attach.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Uniform-ish value in [0, 1).
fn jitter_unit() -> f64 {
    (Uuid::new_v4().as_u128() % 1_000_000) as f64 / 1_000_000.0
}

/// A successfully re-acquired stream plus the listing to resync from.
pub(crate) struct Attached {
    pub handle: StreamHandle,
    pub events: mpsc::Receiver<StreamEvent>,
    pub listing: Vec<(DocumentId, Document)>,
}

/// Open the live stream and fetch the full listing in one step.
///
/// The stream is opened first so no change can fall between the listing
/// and the first delivered event; anything that races in is handled by the
/// reconciler's staleness check. If the listing fails the fresh stream is
/// cancelled and the whole attempt is retried by the caller.
pub(crate) async fn attach(
    store: &Arc<dyn RemoteStore>,
    collection: &CollectionName,
    stream_capacity: usize,
) -> Result<Attached, StoreError> {
    let (events_tx, events) = mpsc::channel(stream_capacity);
    let handle = store.stream_collection(collection, events_tx).await?;

    match store.list_collection(collection).await {
        Ok(listing) => Ok(Attached {
            handle,
            events,
            listing,
        }),
        Err(err) => {
            handle.cancel();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        // Jitter is ±50%, so bound-check rather than compare exactly.
        let d1 = backoff.next_delay();
        assert!(d1 >= Duration::from_millis(500) && d1 < Duration::from_millis(1500));
        let d2 = backoff.next_delay();
        assert!(d2 >= Duration::from_secs(1) && d2 < Duration::from_secs(3));

        // Attempts 5.. would be 32s+ without the cap.
        for _ in 0..10 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempts(), 5);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        let d = backoff.next_delay();
        assert!(d < Duration::from_millis(1500));
    }

    #[test]
    fn test_backoff_no_overflow_at_high_attempts() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert!(backoff.next_delay() <= Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_unit_range() {
        for _ in 0..64 {
            let j = jitter_unit();
            assert!((0.0..1.0).contains(&j));
        }
    }
}
