//! # Reconnection Supervisor
//!
//! Retries a readiness probe with exponential backoff until it succeeds or
//! the garden is asked to stop.
//!
//! ```text
//! ┌────────────┐  false   ┌─────────────────────┐  slept   ┌────────────┐
//! │ probe()    │ ───────► │ warn + sleep(delay) │ ───────► │ probe()    │ ...
//! └─────┬──────┘          └──────────┬──────────┘          └────────────┘
//!       │ true                       │ stop requested
//!       ▼                            ▼
//!  Readiness::Ready         Readiness::Stopped
//!
//! delay: initial, initial×m, initial×m², ... capped at max
//! ```
//!
//! The stop flag is checked before and after every sleep, and the sleep
//! itself races the stop signal, so a long backoff never delays shutdown.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};


// =============================================================================
// Lifecycle
// =============================================================================

/// Shared "stop requested" signal.
///
/// Clones observe the same flag. [`Lifecycle::child`] derives a lifecycle
/// that stops with its parent but can also be stopped on its own.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    token: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            token: CancellationToken::new(),
        }
    }

    /// Requests stop. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once stop has been requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    pub fn child(&self) -> Lifecycle {
        Lifecycle {
            token: self.token.child_token(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl From<CancellationToken> for Lifecycle {
    fn from(token: CancellationToken) -> Self {
        Lifecycle { token }
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Deterministic exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Builds a never-expiring, jitter-free exponential backoff.
    pub fn to_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.initial,
            initial_interval: self.initial,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// How a supervised wait ended.
///
/// `Stopped` is a cooperative abort, not a failure: the owner asked to stop
/// before the dependency came up.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Stopped,
}

/// Runs a readiness probe until it reports success.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    policy: BackoffPolicy,
}

impl Supervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Supervisor { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Calls `probe` until it returns true.
    ///
    /// Each failure logs `failure_message` at warn level and sleeps for the
    /// next backoff interval. Returns [`Readiness::Stopped`] if
    /// `lifecycle` is stopped before the probe succeeds.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let readiness = supervisor
    ///     .run(|| async { db.health_check().await }, &lifecycle,
    ///          "Unable to connect to the database, is it started?")
    ///     .await;
    /// if readiness == Readiness::Stopped {
    ///     return Ok(());
    /// }
    /// ```
    pub async fn run<F, Fut>(
        &self,
        mut probe: F,
        lifecycle: &Lifecycle,
        failure_message: &str,
    ) -> Readiness
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut backoff = self.policy.to_backoff();
        let mut attempt: u32 = 0;

        loop {
            if lifecycle.is_stopped() {
                debug!(attempt, "Supervisor stopped before probe");
                return Readiness::Stopped;
            }

            attempt += 1;
            if probe().await {
                if attempt > 1 {
                    info!(attempt, "Dependency is now available");
                }
                return Readiness::Ready;
            }

            let delay = backoff.next_backoff().unwrap_or(self.policy.max);
            warn!(attempt, ?delay, "{}", failure_message);

            if lifecycle.is_stopped() {
                return Readiness::Stopped;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = lifecycle.stopped() => {
                    debug!(attempt, "Supervisor stopped during backoff");
                    return Readiness::Stopped;
                }
            }
        }
    }
}
