//! Cancellable one-shot timers
//!
//! A timer is a tokio task sleeping until its deadline. Cancelling reports
//! whether the callback was stopped in time, had already started, or the
//! timer was never armed. Callbacks must still re-check their precondition
//! under the relevant lock; a cancel that loses the race is a no-op.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancel {
    /// The callback will not run
    Cancelled,
    /// The callback already started
    AlreadyFired,
    /// Nothing was armed
    Inactive,
}

/// Handle to an armed timer
#[derive(Debug)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Run `callback` once after `delay` on `runtime`
    pub fn spawn<F>(runtime: &Handle, delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(ARMED));
        let flag = state.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if flag
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                callback();
            }
        });
        Self { state, task }
    }

    /// Stop the timer if it has not fired yet
    pub fn cancel(&self) -> Cancel {
        match self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.task.abort();
                Cancel::Cancelled
            }
            Err(FIRED) => Cancel::AlreadyFired,
            Err(_) => Cancel::Inactive,
        }
    }

    /// True while the deadline is pending
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }
}

/// Cancel an optional timer slot, leaving it empty
pub fn cancel_slot(slot: &mut Option<TimerHandle>) -> Cancel {
    match slot.take() {
        Some(timer) => timer.cancel(),
        None => Cancel::Inactive,
    }
}
