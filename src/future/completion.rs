use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::error;
use tokio::sync::Notify;

use crate::state::State;

pub(crate) type DoneCallback = Box<dyn FnOnce(&State) + Send>;

#[derive(Default)]
struct Slot {
    state: Option<State>,
    callbacks: Vec<DoneCallback>,
}

/// Write-once slot for a run's final state, waitable from threads and tasks.
#[derive(Default)]
pub(crate) struct Completion {
    slot: Mutex<Slot>,
    ready: Condvar,
    notify: Notify,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn completed(state: State) -> Self {
        let completion = Self::new();
        completion.complete(state);
        completion
    }

    /// Stores the final state and fires callbacks. Only the first call wins.
    pub(crate) fn complete(&self, state: State) -> bool {
        let callbacks = {
            let Ok(mut slot) = self.slot.lock() else {
                return false;
            };
            if slot.state.is_some() {
                return false;
            }
            slot.state = Some(state.clone());
            std::mem::take(&mut slot.callbacks)
        };

        self.ready.notify_all();
        self.notify.notify_waiters();
        for callback in callbacks {
            fire(callback, &state);
        }
        true
    }

    pub(crate) fn get(&self) -> Option<State> {
        self.slot.lock().ok().and_then(|s| s.state.clone())
    }

    pub(crate) fn is_done(&self) -> bool {
        self.get().is_some()
    }

    /// Blocks until complete, or until `timeout` passes.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<State> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut slot = self.slot.lock().ok()?;
        loop {
            if let Some(state) = &slot.state {
                return Some(state.clone());
            }
            slot = match deadline {
                None => self.ready.wait(slot).ok()?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.ready.wait_timeout(slot, deadline - now).ok()?.0
                }
            };
        }
    }

    pub(crate) async fn wait_async(&self) -> State {
        loop {
            let notified = self.notify.notified();
            if let Some(state) = self.get() {
                return state;
            }
            notified.await;
        }
    }

    /// Registers a callback, or fires it now if already complete.
    pub(crate) fn add_callback(&self, callback: DoneCallback) {
        let state = match self.slot.lock() {
            Ok(mut slot) => match &slot.state {
                Some(state) => state.clone(),
                None => {
                    slot.callbacks.push(callback);
                    return;
                }
            },
            Err(_) => return,
        };
        fire(callback, &state);
    }
}

fn fire(callback: DoneCallback, state: &State) {
    if catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
        error!("Done callback panicked");
    }
}
