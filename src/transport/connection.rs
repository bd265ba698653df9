//! Connection lifecycle state machine.
//!
//! ```text
//! DISCONNECTED ──► CONNECTING ──► CONNECTED ──► RECONNECTING ──► CONNECTED
//!                      │                            │   ▲
//!                      ▼                            ▼   │ (retries remain)
//!                    FAILED ◄───────────────────── FAILED
//! ```
//!
//! Every phase may move to DISCONNECTED through an explicit close.

use std::time::{Duration, Instant};

use crate::core::constants::DEFAULT_MAX_RETRIES;
use crate::core::{InvalidTransition, Phase, TransportMode};

/// Lifecycle state of one peer link.
///
/// Pure bookkeeping: no I/O, no timers. Driven by the connection manager and
/// the reliability manager. A rejected transition leaves the state untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    phase: Phase,
    mode: Option<TransportMode>,
    connected_at: Option<Instant>,
    retry_count: u32,
    max_retries: u32,
    fatal: bool,
}

/// Read-only copy of a [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Current phase.
    pub phase: Phase,
    /// Active mode, set only while connected.
    pub mode: Option<TransportMode>,
    /// Time connected, zero when not connected.
    pub uptime: Duration,
    /// Reconnection attempts since the last successful connect.
    pub retry_count: u32,
    /// Whether FAILED is final.
    pub terminal: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl ConnectionState {
    /// Fresh state in DISCONNECTED.
    pub fn new(max_retries: u32) -> Self {
        Self {
            phase: Phase::Disconnected,
            mode: None,
            connected_at: None,
            retry_count: 0,
            max_retries,
            fatal: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Active mode. `None` unless CONNECTED.
    pub fn mode(&self) -> Option<TransportMode> {
        self.mode
    }

    /// When the current connection was established.
    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    /// Reconnection attempts since the last successful connect.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Configured retry budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether another reconnection attempt is allowed.
    pub fn retries_remaining(&self) -> bool {
        !self.fatal && self.retry_count < self.max_retries
    }

    /// FAILED with no way back to RECONNECTING.
    pub fn is_terminal(&self) -> bool {
        self.phase == Phase::Failed && !self.retries_remaining()
    }

    /// Whether `self.phase -> to` is an edge of the state machine.
    ///
    /// CONNECTED is reachable only through [`establish`](Self::establish),
    /// which also records the mode.
    pub fn can_transition(&self, to: Phase) -> bool {
        use Phase::*;
        match (self.phase, to) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Failed) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Failed) => true,
            (Failed, Reconnecting) => self.retries_remaining(),
            _ => false,
        }
    }

    /// Move to `to`, or fail with [`InvalidTransition`] leaving state unchanged.
    pub fn transition(&mut self, to: Phase) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition {
                from: self.phase,
                to,
            });
        }
        match to {
            Phase::Disconnected => {
                self.mode = None;
                self.connected_at = None;
                self.retry_count = 0;
                self.fatal = false;
            }
            Phase::Connecting => {
                self.fatal = false;
            }
            Phase::Reconnecting | Phase::Failed => {
                self.mode = None;
                self.connected_at = None;
            }
            // Rejected by `can_transition`; use `establish`.
            Phase::Connected => {}
        }
        self.phase = to;
        Ok(())
    }

    /// Enter CONNECTED over `mode` from CONNECTING or RECONNECTING.
    ///
    /// Sets `connected_at` and resets the retry counter.
    pub fn establish(&mut self, mode: TransportMode) -> Result<(), InvalidTransition> {
        if !matches!(self.phase, Phase::Connecting | Phase::Reconnecting) {
            return Err(InvalidTransition {
                from: self.phase,
                to: Phase::Connected,
            });
        }
        self.phase = Phase::Connected;
        self.mode = Some(mode);
        self.connected_at = Some(Instant::now());
        self.retry_count = 0;
        self.fatal = false;
        Ok(())
    }

    /// Count one reconnection attempt. Returns the new count.
    pub fn record_retry(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// Make FAILED terminal regardless of the retry budget.
    pub fn mark_fatal(&mut self) {
        self.fatal = true;
    }

    /// Time since CONNECTED was entered, zero otherwise.
    pub fn uptime(&self) -> Duration {
        self.connected_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Copy of the observable state.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            phase: self.phase,
            mode: self.mode,
            uptime: self.uptime(),
            retry_count: self.retry_count,
            terminal: self.is_terminal(),
        }
    }

    /// Whether the structural invariants hold.
    pub fn is_consistent(&self) -> bool {
        match self.phase {
            Phase::Connected => self.mode.is_some() && self.connected_at.is_some(),
            _ => self.mode.is_none() && self.connected_at.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initial_state() {
        let state = ConnectionState::default();
        assert_eq!(state.phase(), Phase::Disconnected);
        assert_eq!(state.mode(), None);
        assert_eq!(state.max_retries(), 3);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_happy_path() {
        let mut state = ConnectionState::new(3);
        state.transition(Phase::Connecting).unwrap();
        state.establish(TransportMode::Quic).unwrap();
        assert_eq!(state.phase(), Phase::Connected);
        assert_eq!(state.mode(), Some(TransportMode::Quic));
        assert!(state.connected_at().is_some());

        state.transition(Phase::Reconnecting).unwrap();
        assert_eq!(state.mode(), None);
        state.record_retry();
        state.establish(TransportMode::Tcp).unwrap();
        assert_eq!(state.retry_count(), 0);
        assert_eq!(state.mode(), Some(TransportMode::Tcp));
    }

    #[test]
    fn test_direct_connect_is_rejected() {
        let mut state = ConnectionState::new(3);
        let err = state.establish(TransportMode::Quic).unwrap_err();
        assert_eq!(err.from, Phase::Disconnected);
        assert_eq!(err.to, Phase::Connected);
        assert!(state.transition(Phase::Connected).is_err());
        assert_eq!(state, ConnectionState::new(3));
    }

    #[test]
    fn test_failed_becomes_terminal_after_retries() {
        let mut state = ConnectionState::new(2);
        state.transition(Phase::Connecting).unwrap();
        state.establish(TransportMode::Quic).unwrap();
        state.transition(Phase::Reconnecting).unwrap();

        for _ in 0..2 {
            state.record_retry();
            state.transition(Phase::Failed).unwrap();
            if state.is_terminal() {
                break;
            }
            state.transition(Phase::Reconnecting).unwrap();
        }
        assert!(state.is_terminal());
        assert!(state.transition(Phase::Reconnecting).is_err());
        assert!(state.transition(Phase::Disconnected).is_ok());
        assert_eq!(state.retry_count(), 0);
    }

    #[test]
    fn test_fatal_failure_is_terminal() {
        let mut state = ConnectionState::new(3);
        state.transition(Phase::Connecting).unwrap();
        state.transition(Phase::Failed).unwrap();
        assert!(!state.is_terminal());
        state.mark_fatal();
        assert!(state.is_terminal());
        assert!(!state.can_transition(Phase::Reconnecting));
    }

    #[derive(Debug, Clone)]
    enum Op {
        To(Phase),
        Establish(TransportMode),
        Retry,
        Fatal,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::sample::select(Phase::ALL.to_vec()).prop_map(Op::To),
            prop_oneof![Just(TransportMode::Quic), Just(TransportMode::Tcp)].prop_map(Op::Establish),
            Just(Op::Retry),
            Just(Op::Fatal),
        ]
    }

    proptest! {
        #[test]
        fn test_state_machine_never_inconsistent(
            max_retries in 0u32..5,
            ops in prop::collection::vec(op(), 0..64),
        ) {
            let mut state = ConnectionState::new(max_retries);
            for op in ops {
                let before = state.clone();
                let result = match op {
                    Op::To(phase) => state.transition(phase),
                    Op::Establish(mode) => state.establish(mode),
                    Op::Retry => { state.record_retry(); Ok(()) }
                    Op::Fatal => { state.mark_fatal(); Ok(()) }
                };
                if result.is_err() {
                    prop_assert_eq!(&state, &before);
                }
                prop_assert!(state.is_consistent());
                if state.phase() == Phase::Connected {
                    prop_assert!(state.mode().is_some());
                }
            }
        }
    }
}
