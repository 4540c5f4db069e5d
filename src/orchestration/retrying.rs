use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::warn;
use uuid::Uuid;

use crate::retry::{apply_jitter, RetryDelay};
use crate::run::Run;
use crate::state::State;

use super::{ClientError, OrchestrationClient, RunCreate, TransitionRequest};

/// Backoff settings for transient client errors.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRetrySettings {
    pub max_retries: u32,
    pub jitter_factor: f64,
    pub base_backoff: Duration,
}

impl Default for ClientRetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            jitter_factor: 0.2,
            base_backoff: Duration::from_millis(100),
        }
    }
}

/// Wraps a client and retries calls that fail with a transient error.
///
/// A definitive answer, accepted or not, is returned immediately.
/// Transition proposals keep their idempotency key across attempts, so a
/// proposal whose response was lost is not applied twice.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    inner: Arc<dyn OrchestrationClient>,
    settings: ClientRetrySettings,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn OrchestrationClient>, settings: ClientRetrySettings) -> Self {
        Self { inner, settings }
    }

    pub fn settings(&self) -> &ClientRetrySettings {
        &self.settings
    }

    fn with_retries<T>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let backoff = RetryDelay::Exponential {
            factor: self.settings.base_backoff,
            max: None,
        };
        let mut attempt = 0;
        loop {
            match call() {
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let delay = apply_jitter(backoff.base_delay(attempt), self.settings.jitter_factor);
                    warn!(
                        "{} failed ({}); retrying in {:?} ({}/{})",
                        operation,
                        e,
                        delay,
                        attempt + 1,
                        self.settings.max_retries
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl OrchestrationClient for RetryingClient {
    fn create_run(&self, run: RunCreate) -> Result<Uuid, ClientError> {
        self.with_retries("create_run", || self.inner.create_run(run.clone()))
    }

    fn propose_transition(&self, request: &TransitionRequest) -> Result<State, ClientError> {
        self.with_retries("propose_transition", || self.inner.propose_transition(request))
    }

    fn read_state(&self, run_id: Uuid) -> Result<Option<State>, ClientError> {
        self.with_retries("read_state", || self.inner.read_state(run_id))
    }

    fn read_run(&self, run_id: Uuid) -> Result<Run, ClientError> {
        self.with_retries("read_run", || self.inner.read_run(run_id))
    }
}
