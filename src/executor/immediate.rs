use crate::engine::{Engine, RunRequest, SyncEngine};
use crate::future::RunFuture;

use super::TaskRunner;

/// Runs each submission to completion before `submit` returns.
///
/// Useful for debugging and tests; futures are always already done.
#[derive(Debug, Clone)]
pub struct ImmediateTaskRunner {
    engine: Engine,
}

impl ImmediateTaskRunner {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

impl TaskRunner for ImmediateTaskRunner {
    fn name(&self) -> &str {
        "immediate"
    }

    fn submit_request(&self, request: RunRequest) -> RunFuture {
        let run_id = request.run_id();
        let state = SyncEngine::new(self.engine.clone()).run(request);
        RunFuture::ready(run_id, state)
    }
}
