//! Sync mode state machine and fetch cancellation.
//!
//! The controller starts in `Error` (nothing synced yet) and moves on every
//! fetch outcome:
//! - success: `Fresh`
//! - failure with a usable cached record: `Cached`
//! - failure with nothing usable: `Error`
//!
//! Observers register callbacks that fire on every transition, including
//! `Fresh -> Fresh`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, AbortRegistration, Abortable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Fresh,
    Cached,
    Error,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Fresh => write!(f, "fresh"),
            SyncMode::Cached => write!(f, "cached"),
            SyncMode::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct FallbackState {
    pub mode: SyncMode,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Consecutive failed fetches since the last success
    pub pending_retry_count: u32,
}

impl Default for FallbackState {
    fn default() -> Self {
        Self {
            mode: SyncMode::Error,
            last_sync_at: None,
            pending_retry_count: 0,
        }
    }
}

/// Outcome of one fetch attempt, as far as the controller cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Succeeded,
    FailedWithCache,
    FailedWithoutCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub from: SyncMode,
    pub to: SyncMode,
    pub state: FallbackState,
}

#[derive(Debug)]
pub struct FallbackController {
    state: FallbackState,
    retry: RetryPolicy,
}

impl FallbackController {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            state: FallbackState::default(),
            retry,
        }
    }

    pub fn state(&self) -> FallbackState {
        self.state.clone()
    }

    pub fn mode(&self) -> SyncMode {
        self.state.mode
    }

    /// Apply the transition for one fetch outcome.
    pub fn record(&mut self, outcome: FetchOutcome, now: DateTime<Utc>) -> ModeChange {
        let from = self.state.mode;
        match outcome {
            FetchOutcome::Succeeded => {
                self.state.mode = SyncMode::Fresh;
                self.state.last_sync_at = Some(now);
                self.state.pending_retry_count = 0;
            }
            FetchOutcome::FailedWithCache => {
                self.state.mode = SyncMode::Cached;
                self.state.pending_retry_count = self.state.pending_retry_count.saturating_add(1);
            }
            FetchOutcome::FailedWithoutCache => {
                self.state.mode = SyncMode::Error;
                self.state.pending_retry_count = self.state.pending_retry_count.saturating_add(1);
            }
        }

        if from != self.state.mode {
            info!(from = %from, to = %self.state.mode, failures = self.state.pending_retry_count, "Sync mode changed");
        }

        ModeChange {
            from,
            to: self.state.mode,
            state: self.state.clone(),
        }
    }

    /// Backoff before the next retry, or `None` once back to fresh.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        if self.state.mode == SyncMode::Fresh {
            return None;
        }
        Some(self.retry.delay_for(self.state.pending_retry_count))
    }

    /// Back to the cold-start state. Returns the change if the mode moved.
    pub fn reset(&mut self) -> Option<ModeChange> {
        let from = self.state.mode;
        self.state = FallbackState::default();
        (from != self.state.mode).then(|| ModeChange {
            from,
            to: self.state.mode,
            state: self.state.clone(),
        })
    }
}

// ============================================================================
// Subscribers
// ============================================================================

type Callback = Arc<dyn Fn(&ModeChange) + Send + Sync>;

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct Subscribers {
    inner: Mutex<SubscriberList>,
}

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, Callback)>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ModeChange) + Send + Sync + 'static,
    {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        list.next_id += 1;
        let id = SubscriptionId(list.next_id);
        list.callbacks.push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the token was unknown or already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = list.callbacks.len();
        list.callbacks.retain(|(sid, _)| *sid != id);
        list.callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback. The list lock is released first so callbacks
    /// may subscribe or unsubscribe.
    pub fn notify(&self, change: &ModeChange) {
        let callbacks: Vec<Callback> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        debug!(to = %change.to, subscribers = callbacks.len(), "Notifying mode subscribers");
        for cb in callbacks {
            cb(change);
        }
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers").field("len", &self.len()).finish()
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Abort signal for one fetch. Hand the `Canceller` to whoever may need to
/// cancel (e.g. on navigation) and pass the token to the engine.
#[derive(Debug)]
pub struct FetchToken {
    handle: AbortHandle,
    registration: AbortRegistration,
}

impl FetchToken {
    pub fn new() -> Self {
        let (handle, registration) = AbortHandle::new_pair();
        Self {
            handle,
            registration,
        }
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(self.handle.clone())
    }

    /// Wrap `future` so it stops as soon as the token is cancelled.
    pub fn wrap<F: std::future::Future>(self, future: F) -> Abortable<F> {
        Abortable::new(future, self.registration)
    }
}

impl Default for FetchToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct Canceller(AbortHandle);

impl Canceller {
    /// Cancelling more than once is a no-op.
    pub fn cancel(&self) {
        self.0.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_aborted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_initial_state_is_error() {
        let controller = FallbackController::new(RetryPolicy::default());
        assert_eq!(controller.mode(), SyncMode::Error);
        assert!(controller.state().last_sync_at.is_none());
    }

    #[test]
    fn test_transitions() {
        let mut controller = FallbackController::new(RetryPolicy::default());
        let now = Utc::now();

        let change = controller.record(FetchOutcome::Succeeded, now);
        assert_eq!((change.from, change.to), (SyncMode::Error, SyncMode::Fresh));
        assert_eq!(change.state.last_sync_at, Some(now));

        let change = controller.record(FetchOutcome::FailedWithCache, now);
        assert_eq!((change.from, change.to), (SyncMode::Fresh, SyncMode::Cached));
        assert_eq!(change.state.pending_retry_count, 1);

        let change = controller.record(FetchOutcome::FailedWithoutCache, now);
        assert_eq!(change.to, SyncMode::Error);
        assert_eq!(change.state.pending_retry_count, 2);
        // A failure never touches the last sync time
        assert_eq!(change.state.last_sync_at, Some(now));

        let change = controller.record(FetchOutcome::Succeeded, now);
        assert_eq!(change.to, SyncMode::Fresh);
        assert_eq!(change.state.pending_retry_count, 0);
    }

    #[test]
    fn test_retry_delay_only_while_degraded() {
        let mut controller = FallbackController::new(RetryPolicy::default());
        assert_eq!(controller.next_retry_delay(), Some(Duration::from_millis(1000)));

        controller.record(FetchOutcome::Succeeded, Utc::now());
        assert_eq!(controller.next_retry_delay(), None);

        for _ in 0..10 {
            controller.record(FetchOutcome::FailedWithCache, Utc::now());
        }
        assert_eq!(controller.next_retry_delay(), Some(Duration::from_millis(60_000)));
    }

    #[test]
    fn test_reset() {
        let mut controller = FallbackController::new(RetryPolicy::default());
        assert!(controller.reset().is_none());

        controller.record(FetchOutcome::Succeeded, Utc::now());
        let change = controller.reset().unwrap();
        assert_eq!(change.to, SyncMode::Error);
        assert_eq!(controller.state(), FallbackState::default());
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let subscribers = Subscribers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = subscribers.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let change = ModeChange {
            from: SyncMode::Error,
            to: SyncMode::Fresh,
            state: FallbackState::default(),
        };
        subscribers.notify(&change);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(subscribers.unsubscribe(id));
        assert!(!subscribers.unsubscribe(id));
        subscribers.notify(&change);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let token = FetchToken::new();
        let canceller = token.canceller();
        canceller.cancel();
        canceller.cancel();
        assert!(canceller.is_cancelled());

        let result = token.wrap(std::future::pending::<()>()).await;
        assert!(result.is_err());
    }
}
