//! Wake Signal
//!
//! Single wait primitive with merged wake sources: an explicit signal, the
//! external alarm, or the timeout itself, collapsed into one reason the
//! state machine switches on.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The timed wait ran out.
    Timeout,
    /// The external alarm fired.
    Alarm,
    ConnectivityRestored,
    ConfigChanged,
    SampleRateChanged,
    /// Shutdown requested. Sticky: every later wait returns it immediately.
    Stop,
}

#[derive(Default)]
struct SignalState {
    pending: Option<WakeReason>,
    stopped: bool,
}

/// Condition-variable wake-up cell shared between the worker and notifiers.
#[derive(Default)]
pub struct WakeSignal {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a wake reason. `Stop` latches; any other reason overwrites a
    /// still-pending one (last signal wins).
    pub fn notify(&self, reason: WakeReason) {
        let mut state = self.state.lock();
        if reason == WakeReason::Stop {
            state.stopped = true;
        }
        state.pending = Some(reason);
        self.condvar.notify_all();
    }

    /// Block up to `timeout` for a signal, consuming it. A pending signal is
    /// returned without blocking.
    pub fn wait_timeout(&self, timeout: Duration) -> WakeReason {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                state.pending = None;
                return WakeReason::Stop;
            }
            if let Some(reason) = state.pending.take() {
                return reason;
            }
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                // One last look: a signal racing the timeout wins.
                if state.stopped {
                    return WakeReason::Stop;
                }
                return state.pending.take().unwrap_or(WakeReason::Timeout);
            }
        }
    }
}
