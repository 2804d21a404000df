//! Reconnect policy and the connection-level lifecycle state.
//!
//! A dropped connection instance is never revived. The controller runs
//! connection attempts through [`ReconnectController::run`], sleeping
//! `delay` between failures, until one succeeds, the attempt budget is
//! spent or the connection is closed explicitly.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{IprotoError, Result};

/// Default delay between connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(333);

/// Lifecycle of a [`Connection`](crate::Connection) across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// First or explicitly requested connect in progress.
    Connecting,
    Connected,
    /// Connection lost; attempts are running in the background.
    Reconnecting,
    /// Connection lost with auto-reconnect disabled.
    Disconnected,
    /// Attempt budget spent. Requests fail with `NotConnected`.
    PermanentlyFailed,
    /// Closed by the user.
    Closed,
}

impl ReconnectState {
    /// Whether requests can possibly be served in this state.
    pub fn accepts_requests(self) -> bool {
        matches!(self, ReconnectState::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Reconnect in the background after a connection is lost.
    pub enabled: bool,
    /// Pause between failed attempts.
    pub delay: Duration,
    /// Attempts per outage; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

pub(crate) struct ReconnectController {
    policy: ReconnectPolicy,
    state: watch::Sender<ReconnectState>,
}

impl ReconnectController {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ReconnectState::Connecting);
        Self { policy, state }
    }

    pub(crate) fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub(crate) fn state(&self) -> ReconnectState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ReconnectState> {
        self.state.subscribe()
    }

    /// Move to `next` unconditionally. Used for explicit user actions.
    pub(crate) fn set(&self, next: ReconnectState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "Reconnect state transition");
        }
    }

    /// Move to `next` unless the connection was closed.
    ///
    /// Returns false when the state is `Closed`; only [`set`](Self::set)
    /// leaves it.
    pub(crate) fn advance(&self, next: ReconnectState) -> bool {
        let mut prev = None;
        self.state.send_if_modified(|state| {
            if *state == ReconnectState::Closed || *state == next {
                return false;
            }
            prev = Some(std::mem::replace(state, next));
            true
        });
        if let Some(prev) = prev {
            debug!(from = ?prev, to = ?next, "Reconnect state transition");
        }
        self.state() != ReconnectState::Closed
    }

    /// Run `attempt` until it succeeds or the policy gives up.
    ///
    /// With `stop_on_auth` an authentication failure ends the loop at once;
    /// the initial connect uses it so bad credentials are reported directly.
    pub(crate) async fn run<F, Fut>(&self, stop_on_auth: bool, mut attempt: F) -> Result<()>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut n = 0u32;
        loop {
            if self.state() == ReconnectState::Closed {
                return Err(IprotoError::NotConnected);
            }

            n += 1;
            let err = match attempt(n).await {
                Ok(()) => {
                    if !self.advance(ReconnectState::Connected) {
                        return Err(IprotoError::NotConnected);
                    }
                    if n > 1 {
                        info!(attempts = n, "Connection re-established");
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            if self.state() == ReconnectState::Closed {
                return Err(err);
            }

            let fatal = stop_on_auth && matches!(err, IprotoError::Auth { .. });
            if fatal || !self.policy.enabled {
                warn!(attempt = n, error = %err, "Connection attempt failed");
                self.advance(ReconnectState::Disconnected);
                return Err(err);
            }
            if self.policy.exhausted(n) {
                warn!(attempts = n, error = %err, "Giving up on reconnecting");
                self.advance(ReconnectState::PermanentlyFailed);
                return Err(err);
            }

            warn!(
                attempt = n,
                error = %err,
                delay = ?self.policy.delay,
                "Connection attempt failed, retrying"
            );
            self.pause().await?;
        }
    }

    /// Sleep for the backoff delay unless the connection gets closed.
    async fn pause(&self) -> Result<()> {
        let mut state = self.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.policy.delay) => Ok(()),
            _ = state.wait_for(|s| *s == ReconnectState::Closed) => Err(IprotoError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            delay: Duration::from_millis(5),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let controller = ReconnectController::new(policy(None));
        let calls = AtomicU32::new(0);

        let result = controller
            .run(false, |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(IprotoError::ConnectionLost)
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(controller.state(), ReconnectState::Connected);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_permanent() {
        let controller = ReconnectController::new(policy(Some(2)));

        let result = controller
            .run(false, |_| async { Err(IprotoError::ConnectionLost) })
            .await;

        assert!(matches!(result, Err(IprotoError::ConnectionLost)));
        assert_eq!(controller.state(), ReconnectState::PermanentlyFailed);
        assert!(!controller.state().accepts_requests());
    }

    #[tokio::test]
    async fn test_auth_failure_stops_initial_connect() {
        let controller = ReconnectController::new(policy(None));
        let calls = AtomicU32::new(0);

        let result = controller
            .run(true, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(IprotoError::Auth {
                        code: 47,
                        message: "Incorrect password".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(IprotoError::Auth { code: 47, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_policy_tries_once() {
        let controller = ReconnectController::new(ReconnectPolicy {
            enabled: false,
            ..policy(None)
        });

        let result = controller
            .run(false, |_| async { Err(IprotoError::Timeout) })
            .await;

        assert!(result.is_err());
        assert_eq!(controller.state(), ReconnectState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_interrupts_backoff() {
        let controller = Arc::new(ReconnectController::new(ReconnectPolicy {
            delay: Duration::from_secs(60),
            ..policy(None)
        }));

        let runner = tokio::spawn({
            let controller = controller.clone();
            async move {
                controller
                    .run(false, |_| async { Err(IprotoError::ConnectionLost) })
                    .await
            }
        });

        let mut state = controller.subscribe();
        tokio::task::yield_now().await;
        controller.set(ReconnectState::Closed);
        state
            .wait_for(|s| *s == ReconnectState::Closed)
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("backoff not interrupted")
            .unwrap();
        assert!(matches!(result, Err(IprotoError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_during_attempt_stays_closed() {
        let controller = ReconnectController::new(policy(None));

        let result = controller
            .run(false, |_| {
                // Disconnect lands while the attempt is finishing.
                controller.set(ReconnectState::Closed);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(IprotoError::NotConnected)));
        assert_eq!(controller.state(), ReconnectState::Closed);
    }

    #[test]
    fn test_advance_never_leaves_closed() {
        let controller = ReconnectController::new(policy(None));
        assert!(controller.advance(ReconnectState::Reconnecting));
        assert_eq!(controller.state(), ReconnectState::Reconnecting);

        controller.set(ReconnectState::Closed);
        assert!(!controller.advance(ReconnectState::Connected));
        assert_eq!(controller.state(), ReconnectState::Closed);

        controller.set(ReconnectState::Connecting);
        assert!(controller.advance(ReconnectState::Connected));
    }
}
