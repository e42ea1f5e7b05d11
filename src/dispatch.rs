//! Hand-off of decoded captures to the consumer side.
//!
//! A single slot, not a queue: the rendering and analysis collaborators only
//! ever care about the freshest capture, so a publication replaces whatever
//! the consumer has not picked up yet. Consumers either take ownership of
//! the current result or observe that none is available.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::samples::CaptureResult;

/// Thread-safe single-result hand-off slot.
#[derive(Debug, Default)]
pub struct ResultSlot {
    current: Mutex<Option<CaptureResult>>,
    notify: Notify,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current result. Notifies one waiting consumer on every
    /// publication; a stale unconsumed result is dropped intentionally.
    pub fn publish(&self, result: CaptureResult) {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Some(result);
        drop(current);
        self.notify.notify_one();
    }

    /// Take ownership of the current result, leaving the slot empty.
    /// Non-blocking; returns `None` when nothing has been published since
    /// the last take.
    pub fn take(&self) -> Option<CaptureResult> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Wait until the next publication.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(samplerate: f64) -> CaptureResult {
        CaptureResult {
            samplerate,
            ..Default::default()
        }
    }

    #[test]
    fn publish_replaces_previous_result() {
        let slot = ResultSlot::new();
        assert!(slot.take().is_none());

        slot.publish(result(1.0));
        slot.publish(result(2.0));
        // The late consumer only sees the freshest capture.
        assert_eq!(slot.take().unwrap().samplerate, 2.0);
        assert!(slot.take().is_none());
    }

    #[tokio::test]
    async fn publication_wakes_a_waiting_consumer() {
        use std::sync::Arc;

        let slot = Arc::new(ResultSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                slot.ready().await;
                slot.take()
            })
        };
        // Give the waiter a chance to park before publishing.
        tokio::task::yield_now().await;
        slot.publish(result(3.0));
        let taken = waiter.await.unwrap();
        assert_eq!(taken.unwrap().samplerate, 3.0);
    }
}
