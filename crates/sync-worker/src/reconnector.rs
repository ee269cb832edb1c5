use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use sync_core::{Observable, ObservableValue, RetryPolicy};
use tokio::time::Instant;
use tracing::{info, warn};

/// Connectivity as seen by the request scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Online,
    Reconnecting,
    Offline,
}

/// Snapshot of the reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    /// Delay applied after the most recent failure, or the floor.
    pub current_delay: Duration,
    /// Consecutive network failures since the last success.
    pub attempts: u32,
    pub last_success: Option<Instant>,
    /// Earliest instant at which the next call may go out.
    pub retry_at: Option<Instant>,
}

/// Tracks connectivity and paces calls after network failures.
#[derive(Debug)]
pub struct Reconnector {
    policy: RetryPolicy,
    state: Mutex<BackoffState>,
    status: ObservableValue<ConnectionStatus>,
}

impl Reconnector {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(BackoffState {
                current_delay: policy.floor(),
                attempts: 0,
                last_success: None,
                retry_at: None,
            }),
            status: ObservableValue::new(ConnectionStatus::Online),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    pub fn status_observable(&self) -> Observable<ConnectionStatus> {
        self.status.reader()
    }

    pub fn backoff(&self) -> BackoffState {
        *self.lock()
    }

    /// Earliest instant the next call may be issued, if backing off.
    pub fn retry_at(&self) -> Option<Instant> {
        self.lock().retry_at
    }

    /// Record a network failure and return the delay before the next attempt.
    pub fn on_network_failure(&self) -> Duration {
        let delay = {
            let mut state = self.lock();
            let delay = self.policy.delay_for_attempt(state.attempts, None);
            state.attempts = state.attempts.saturating_add(1);
            state.current_delay = delay;
            state.retry_at = Some(Instant::now() + delay);
            delay
        };

        if self.status.set(ConnectionStatus::Reconnecting) {
            warn!(delay_ms = delay.as_millis() as u64, "homeserver unreachable; reconnecting");
        }
        delay
    }

    /// Record a successful call; resets the backoff to its floor.
    pub fn on_success(&self) {
        {
            let mut state = self.lock();
            state.attempts = 0;
            state.current_delay = self.policy.floor();
            state.last_success = Some(Instant::now());
            state.retry_at = None;
        }

        if self.status.set(ConnectionStatus::Online) {
            info!("homeserver connection restored");
        }
    }

    /// Give up for now; callers surface the failure.
    pub fn mark_offline(&self) {
        if self.status.set(ConnectionStatus::Offline) {
            warn!("homeserver marked offline");
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackoffState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
