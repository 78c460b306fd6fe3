use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tracing::debug;

use crate::{
    error::ClientError,
    listeners::{ListenerId, ListenerRegistry},
    lock,
    types::SyncState,
};

/// Callback invoked with `(new_state, old_state)` on every transition.
pub type SyncStateListener = dyn Fn(SyncState, SyncState) + Send + Sync;

/// One applied transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub current: SyncState,
    pub previous: SyncState,
}

/// Transition rules of the sync connection, without any I/O.
#[derive(Debug, Clone)]
pub struct SyncStateMachine {
    state: SyncState,
    prepared: bool,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self {
            state: SyncState::Stopped,
            prepared: false,
        }
    }
}

impl SyncStateMachine {
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Whether a sync cycle ever completed since the last start.
    pub fn has_prepared(&self) -> bool {
        self.prepared
    }

    pub fn on_sync_success(&mut self) -> Result<StateTransition, ClientError> {
        let next = if self.prepared {
            SyncState::Syncing
        } else {
            SyncState::Prepared
        };
        let transition = self.transition(next, "sync_success")?;
        self.prepared = true;
        Ok(transition)
    }

    pub fn on_sync_failure(&mut self) -> Result<StateTransition, ClientError> {
        let next = if self.state.is_erroring() {
            SyncState::Reconnecting
        } else {
            SyncState::Error
        };
        self.transition(next, "sync_failure")
    }

    pub fn on_keepalive_success(&mut self) -> Result<StateTransition, ClientError> {
        self.transition(SyncState::Catchup, "keepalive_success")
    }

    /// Stopping an already stopped machine is a no-op.
    pub fn on_stop(&mut self) -> Option<StateTransition> {
        if self.state == SyncState::Stopped {
            return None;
        }
        self.prepared = false;
        self.transition(SyncState::Stopped, "stop").ok()
    }

    fn transition(&mut self, next: SyncState, action: &str) -> Result<StateTransition, ClientError> {
        if !self.state.can_transition_to(next) {
            return Err(ClientError::invalid_state(self.state, action));
        }
        let previous = self.state;
        self.state = next;
        Ok(StateTransition {
            current: next,
            previous,
        })
    }
}

/// Shared view of the sync lifecycle: current state, listeners, and whether
/// sync echoes can currently be relied upon.
#[derive(Default)]
pub struct SyncLifecycle {
    machine: Mutex<SyncStateMachine>,
    listeners: ListenerRegistry<SyncStateListener>,
    started: AtomicBool,
    halted: AtomicBool,
}

impl SyncLifecycle {
    pub fn state(&self) -> SyncState {
        lock(&self.machine).state()
    }

    pub fn subscribe(&self, listener: Arc<SyncStateListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// `true` between an explicit start and the matching stop.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// `true` once the loop gave up after a non-retryable failure.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Whether a write can expect to see its echo in a later sync payload.
    pub fn echo_reliable(&self) -> bool {
        self.has_started() && !self.is_halted()
    }

    pub(crate) fn mark_started(&self) {
        self.halted.store(false, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_halted(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    /// Apply one step of the machine and notify listeners outside the lock.
    pub(crate) fn apply<F>(&self, step: F) -> Result<Option<StateTransition>, ClientError>
    where
        F: FnOnce(&mut SyncStateMachine) -> Result<Option<StateTransition>, ClientError>,
    {
        let transition = {
            let mut machine = lock(&self.machine);
            step(&mut machine)?
        };

        if let Some(transition) = transition {
            debug!(
                current = ?transition.current,
                previous = ?transition.previous,
                "sync state changed"
            );
            for listener in self.listeners.snapshot() {
                listener(transition.current, transition.previous);
            }
        }
        Ok(transition)
    }
}
