//! Stage state machine.
//!
//! ```text
//! Uninitialized --init--> Initialized --open--> Open --start--> Running <--pause--> Paused
//!       ^                      |                 ^                 |                   |
//!       +--------close---------+-----close-------+     Stopped <---+-------stop--------+
//!                                                         |  --start--> Running
//!                                                         +--close--> Uninitialized
//! ```
//!
//! Every transition is a compare-and-swap from the required source state to
//! a busy marker, then to the target state. Only one caller can hold the busy
//! marker, so only one thread drives a transition at a time.

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::error::{PreconditionError, Result};

const BUSY: u8 = u8::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StageState {
    Uninitialized = 0,
    Initialized = 1,
    /// Codec/device resources may be allocated; no worker.
    Open = 2,
    Running = 3,
    Paused = 4,
    /// Worker joined and codec/device resources released; negotiated
    /// parameters kept. Behaves like `Open`.
    Stopped = 5,
    /// A lifecycle call is in progress on another thread.
    Transitioning = BUSY,
}

impl StageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StageState::Uninitialized,
            1 => StageState::Initialized,
            2 => StageState::Open,
            3 => StageState::Running,
            4 => StageState::Paused,
            5 => StageState::Stopped,
            _ => StageState::Transitioning,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, StageState::Running | StageState::Paused)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageState::Uninitialized => "uninitialized",
            StageState::Initialized => "initialized",
            StageState::Open => "open",
            StageState::Running => "running",
            StageState::Paused => "paused",
            StageState::Stopped => "stopped",
            StageState::Transitioning => "transitioning",
        };
        f.write_str(name)
    }
}

pub struct Lifecycle {
    name: String,
    state: AtomicU8,
    pause_lock: Mutex<()>,
    pause_changed: Condvar,
}

impl Lifecycle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: AtomicU8::new(StageState::Uninitialized as u8),
            pause_lock: Mutex::new(()),
            pause_changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_paused(&self) -> bool {
        self.state() == StageState::Paused
    }

    /// Claims the transition `from -> to` for the calling thread.
    ///
    /// Fails with `AlreadyInState` when the stage already sits in `to`, with
    /// `InvalidState` for any other state outside `from`.
    pub fn begin(
        &self,
        op: &'static str,
        from: &[StageState],
        to: StageState,
    ) -> Result<Transition<'_>> {
        loop {
            let raw = self.state.load(Ordering::Acquire);
            let current = StageState::from_u8(raw);
            if current == StageState::Transitioning {
                return Err(PreconditionError::TransitionInProgress {
                    stage: self.name.clone(),
                }
                .into());
            }
            if !from.contains(&current) {
                let err = if current == to {
                    PreconditionError::AlreadyInState {
                        stage: self.name.clone(),
                        state: current,
                    }
                } else {
                    PreconditionError::InvalidState {
                        stage: self.name.clone(),
                        op,
                        state: current,
                    }
                };
                return Err(err.into());
            }
            if self
                .state
                .compare_exchange(raw, BUSY, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Transition {
                    lifecycle: self,
                    from: current,
                    to,
                    done: false,
                });
            }
        }
    }

    fn store(&self, state: StageState) {
        {
            let _guard = self.pause_lock.lock();
            self.state.store(state as u8, Ordering::Release);
        }
        self.pause_changed.notify_all();
    }

    /// Sleeps while the stage is paused, at most `timeout`.
    pub fn wait_while_paused(&self, timeout: Duration) {
        let mut guard = self.pause_lock.lock();
        if self.is_paused() {
            self.pause_changed.wait_for(&mut guard, timeout);
        }
    }
}

/// A claimed transition. Reverts to the source state unless committed.
pub struct Transition<'a> {
    lifecycle: &'a Lifecycle,
    from: StageState,
    to: StageState,
    done: bool,
}

impl Transition<'_> {
    pub fn from(&self) -> StageState {
        self.from
    }

    pub fn to(&self) -> StageState {
        self.to
    }

    pub fn commit(mut self) {
        self.done = true;
        self.lifecycle.store(self.to);
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.lifecycle.store(self.from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_transition_commit_and_revert() {
        let lc = Lifecycle::new("stage");
        lc.begin("init", &[StageState::Uninitialized], StageState::Initialized)
            .unwrap()
            .commit();
        assert_eq!(lc.state(), StageState::Initialized);

        {
            let t = lc
                .begin("open", &[StageState::Initialized], StageState::Open)
                .unwrap();
            assert_eq!(lc.state(), StageState::Transitioning);
            assert_eq!(t.from(), StageState::Initialized);
            // dropped without commit
        }
        assert_eq!(lc.state(), StageState::Initialized);
    }

    #[test]
    fn test_precondition_results() {
        let lc = Lifecycle::new("stage");
        let err = lc
            .begin("start", &[StageState::Open], StageState::Running)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Precondition(PreconditionError::InvalidState {
                op: "start",
                state: StageState::Uninitialized,
                ..
            })
        ));

        let err = lc
            .begin("close", &[StageState::Open], StageState::Uninitialized)
            .err()
            .unwrap();
        assert!(err.is_already_in_state());
    }

    #[test]
    fn test_concurrent_transition_rejected() {
        let lc = Lifecycle::new("stage");
        let _held = lc
            .begin("init", &[StageState::Uninitialized], StageState::Initialized)
            .unwrap();
        let err = lc
            .begin("init", &[StageState::Uninitialized], StageState::Initialized)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Precondition(PreconditionError::TransitionInProgress { .. })
        ));
    }
}
