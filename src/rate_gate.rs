//! Sliding-window admission control.
//!
//! A [`RateGate`] admits at most `max_requests` sends per `window` for each
//! scope. Samples live in a process-wide map behind a `parking_lot::Mutex`;
//! the check and the append happen in one critical section, so concurrent
//! callers can never overshoot the limit. The lock is never held across an
//! await.
//!
//! Time comes from `tokio::time::Instant` so tests can pause the clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VolleyError};

/// Outcome of a single [`RateGate::check_limit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// When a denied caller may try again. `None` when allowed.
    pub reset_at: Option<Instant>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reset_at: None,
        }
    }

    fn deny(reset_at: Instant) -> Self {
        Self {
            allowed: false,
            reset_at: Some(reset_at),
        }
    }
}

/// One `(max_requests, window)` limit, tracked per scope.
#[derive(Debug)]
pub struct RateGate {
    name: String,
    max_requests: u32,
    window: Duration,
    scopes: Mutex<HashMap<String, VecDeque<(Instant, u32)>>>,
}

impl RateGate {
    /// Create a gate. `name` labels the gate in logs and metrics.
    pub fn new(name: impl Into<String>, max_requests: u32, window: Duration) -> Result<Self> {
        let name = name.into();
        if max_requests == 0 {
            return Err(VolleyError::Configuration(format!(
                "rate gate '{name}' must admit at least one request per window"
            )));
        }
        if window.is_zero() {
            return Err(VolleyError::Configuration(format!(
                "rate gate '{name}' window must be non-zero"
            )));
        }
        Ok(Self {
            name,
            max_requests,
            window,
            scopes: Mutex::new(HashMap::new()),
        })
    }

    /// Gate admitting `max_requests` per second.
    pub fn per_second(max_requests: u32) -> Result<Self> {
        Self::new("per_second", max_requests, Duration::from_secs(1))
    }

    /// Gate admitting `max_requests` per minute.
    pub fn per_minute(max_requests: u32) -> Result<Self> {
        Self::new("per_minute", max_requests, Duration::from_secs(60))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit one request for `scope` if the window has room, recording it.
    pub fn check_limit(&self, scope: &str) -> RateDecision {
        let now = Instant::now();
        let mut scopes = self.scopes.lock();
        let samples = scopes.entry(scope.to_string()).or_default();

        while let Some(&(at, _)) = samples.front() {
            if now.duration_since(at) >= self.window {
                samples.pop_front();
            } else {
                break;
            }
        }

        let in_window: u64 = samples.iter().map(|&(_, count)| u64::from(count)).sum();
        if in_window >= u64::from(self.max_requests) {
            let reset_at = samples
                .front()
                .map(|&(oldest, _)| oldest + self.window)
                .unwrap_or(now + self.window);
            drop(scopes);

            counter!("volley_rate_gate_denied_total", "gate" => self.name.clone()).increment(1);
            tracing::debug!(
                gate = %self.name,
                scope,
                in_window,
                retry_in_ms = reset_at.saturating_duration_since(now).as_millis() as u64,
                "Rate gate denied request"
            );
            return RateDecision::deny(reset_at);
        }

        samples.push_back((now, 1));
        RateDecision::allow()
    }

    /// Check once and, if denied, sleep until the reported reset time.
    ///
    /// Does not re-check after waking: the caller is not guaranteed a slot.
    /// Use [`acquire`](Self::acquire) when the send must be counted.
    pub async fn wait_for_limit(&self, scope: &str) {
        let decision = self.check_limit(scope);
        if let Some(reset_at) = decision.reset_at {
            tokio::time::sleep_until(reset_at).await;
        }
    }

    /// Wait until a slot for `scope` is admitted and recorded.
    ///
    /// Returns `false` if `cancel` fires first; nothing is recorded then.
    pub async fn acquire(&self, scope: &str, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let decision = self.check_limit(scope);
            let Some(reset_at) = decision.reset_at else {
                return true;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(reset_at) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Discard samples older than twice the window and forget empty scopes.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let horizon = self.window * 2;
        let mut scopes = self.scopes.lock();
        for samples in scopes.values_mut() {
            samples.retain(|&(at, _)| now.duration_since(at) < horizon);
        }
        scopes.retain(|_, samples| !samples.is_empty());
    }

    /// Number of scopes currently tracked.
    pub fn scope_count(&self) -> usize {
        self.scopes.lock().len()
    }

    /// Requests recorded for `scope` in the current window.
    pub fn in_window(&self, scope: &str) -> u64 {
        let now = Instant::now();
        self.scopes
            .lock()
            .get(scope)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|&&(at, _)| now.duration_since(at) < self.window)
                    .map(|&(_, count)| u64::from(count))
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `shutdown` fires.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            tracing::debug!(
                gate = %gate.name,
                interval_ms = interval.as_millis() as u64,
                "Rate gate cleanup started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        gate.cleanup();
                        tracing::trace!(
                            gate = %gate.name,
                            scopes = gate.scope_count(),
                            "Rate gate cleanup ran"
                        );
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!(gate = %gate.name, "Shutting down rate gate cleanup");
                        break;
                    }
                }
            }
        })
    }
}
