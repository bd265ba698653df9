//! Retry policy, reconnection decisions and keep-alive.
//!
//! The [`ReliabilityManager`] owns no socket. It drives a caller-locked
//! [`ConnectionState`] through loss and recovery and tells the connection
//! manager what to do next via [`LossDecision`]. The keep-alive loop talks
//! to the connection through the [`KeepAliveHost`] seam.

use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use super::config::ReliabilityPolicy;
use super::events::{EventBus, TransportEvent};
use crate::core::constants::SESSION_PROBE_NONCE;
use crate::core::{ErrorClass, LinkError, Phase, TransportMode};
use crate::transport::ConnectionState;

/// What the connection manager should do after a loss or failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossDecision {
    /// Sleep `delay`, then run reconnection attempt `attempt` (1-based).
    Retry {
        /// Attempt number.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// Terminal failure; the `failed` event has been emitted.
    GiveUp {
        /// Final cause.
        reason: String,
    },
    /// Nothing to do (closed, or the loss was already handled).
    Ignore,
}

/// Connection side of the keep-alive loop.
#[async_trait]
pub trait KeepAliveHost: Send + Sync + 'static {
    /// Write a ping on the current link. Returns the link generation it was
    /// written on, or `None` if there is no usable link right now.
    async fn send_ping(&self, nonce: u64) -> Option<u64>;

    /// No pong arrived in time on link `generation`.
    fn keep_alive_failed(&self, generation: u64, err: LinkError);
}

/// Retry/backoff policy and keep-alive driver for one connection.
#[derive(Debug)]
pub struct ReliabilityManager {
    policy: ReliabilityPolicy,
    events: EventBus,
    next_nonce: AtomicU64,
    last_pong: watch::Sender<u64>,
}

impl ReliabilityManager {
    /// Manager emitting lifecycle events on `events`.
    pub fn new(policy: ReliabilityPolicy, events: EventBus) -> Self {
        let (last_pong, _) = watch::channel(SESSION_PROBE_NONCE);
        Self {
            policy,
            events,
            next_nonce: AtomicU64::new(SESSION_PROBE_NONCE + 1),
            last_pong,
        }
    }

    /// The policy in force.
    pub fn policy(&self) -> &ReliabilityPolicy {
        &self.policy
    }

    /// An established link dropped.
    ///
    /// Transient causes schedule a reconnection; permanent causes fail the
    /// connection for good. Ignored unless the state is CONNECTED.
    pub fn on_connection_lost(&self, state: &mut ConnectionState, reason: &LinkError) -> LossDecision {
        if state.phase() != Phase::Connected {
            return LossDecision::Ignore;
        }
        if state.transition(Phase::Reconnecting).is_err() {
            return LossDecision::Ignore;
        }
        let transient = reason.class() == ErrorClass::Transient;
        warn!(%reason, transient, "connection lost");
        self.events.emit(
            state.phase(),
            TransportEvent::ConnectionLost {
                reason: reason.to_string(),
                transient,
            },
        );

        if !transient {
            state.mark_fatal();
            return self.fail(state, reason.to_string());
        }
        self.next_attempt(state)
    }

    /// A reconnection attempt failed with `reason`.
    pub fn on_attempt_failed(&self, state: &mut ConnectionState, reason: &LinkError) -> LossDecision {
        if state.phase() != Phase::Reconnecting {
            return LossDecision::Ignore;
        }
        warn!(%reason, attempt = state.retry_count(), "reconnection attempt failed");
        if state.transition(Phase::Failed).is_err() {
            return LossDecision::Ignore;
        }
        if reason.class() == ErrorClass::Permanent {
            state.mark_fatal();
        }
        if state.is_terminal() {
            return self.give_up(state, reason.to_string());
        }
        self.next_attempt(state)
    }

    /// Schedule the next attempt from RECONNECTING or a non-terminal FAILED.
    pub fn next_attempt(&self, state: &mut ConnectionState) -> LossDecision {
        if state.phase() == Phase::Failed {
            if state.is_terminal() {
                return self.give_up(state, "retries exhausted".into());
            }
            if state.transition(Phase::Reconnecting).is_err() {
                return LossDecision::Ignore;
            }
        }
        if state.phase() != Phase::Reconnecting {
            return LossDecision::Ignore;
        }
        if !state.retries_remaining() {
            return self.fail(state, "retries exhausted".into());
        }

        let delay = self.policy.backoff_for(state.retry_count());
        let attempt = state.record_retry();
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnection");
        self.events.emit(
            state.phase(),
            TransportEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            },
        );
        LossDecision::Retry { attempt, delay }
    }

    /// A reconnection attempt succeeded over `mode`.
    pub fn on_reconnected(&self, state: &mut ConnectionState, mode: TransportMode) -> bool {
        let attempts = state.retry_count();
        if state.establish(mode).is_err() {
            return false;
        }
        info!(%mode, attempts, "reconnected");
        self.events
            .emit(state.phase(), TransportEvent::Reconnected { mode, attempts });
        true
    }

    /// Record a pong.
    pub fn on_pong(&self, nonce: u64) {
        self.last_pong.send_if_modified(|last| {
            if nonce > *last {
                *last = nonce;
                true
            } else {
                false
            }
        });
    }

    /// Start the periodic ping loop for `host`.
    ///
    /// The loop ends when `shutdown` flips, the sender is dropped, or the
    /// host is gone.
    pub fn spawn_keep_alive<H: KeepAliveHost>(
        self: &std::sync::Arc<Self>,
        host: Weak<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let interval = this.policy.keep_alive_interval;
            let wait = this.policy.keep_alive_timeout;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                let Some(host) = host.upgrade() else { break };

                let nonce = this.next_nonce.fetch_add(1, Ordering::Relaxed);
                let mut pongs = this.last_pong.subscribe();
                let Some(generation) = host.send_ping(nonce).await else {
                    continue;
                };
                debug!(nonce, generation, "keep-alive ping sent");

                let answered = timeout(wait, async {
                    pongs.wait_for(|last| *last >= nonce).await.is_ok()
                })
                .await
                .unwrap_or(false);
                if !answered {
                    host.keep_alive_failed(generation, LinkError::KeepAliveTimeout(wait));
                }
            }
            debug!("keep-alive stopped");
        })
    }

    fn fail(&self, state: &mut ConnectionState, reason: String) -> LossDecision {
        if state.transition(Phase::Failed).is_err() {
            return LossDecision::Ignore;
        }
        self.give_up(state, reason)
    }

    fn give_up(&self, state: &ConnectionState, reason: String) -> LossDecision {
        error!(%reason, retries = state.retry_count(), "connection failed");
        self.events.emit(
            state.phase(),
            TransportEvent::Failed {
                reason: reason.clone(),
            },
        );
        LossDecision::GiveUp { reason }
    }
}
