use std::sync::Arc;

use log::{debug, error, warn};
use tokio::runtime::{Handle, TryCurrentError};
use uuid::Uuid;

use crate::engine::{AsyncEngine, Engine, RunRequest};
use crate::error::TaskError;
use crate::future::{Backend, Completion, RunFuture};
use crate::orchestration::{OrchestrationClient, TransitionRequest};
use crate::state::State;

use super::TaskRunner;

/// Runs submissions as tasks on a tokio runtime.
///
/// Futures from this runner can be aborted: the run task is dropped at
/// its next suspension point, its transaction is rolled back, and the run
/// is reported `Crashed` to the orchestrator before the future resolves.
#[derive(Debug, Clone)]
pub struct TokioTaskRunner {
    engine: Engine,
    handle: Handle,
}

impl TokioTaskRunner {
    /// Uses the runtime the caller is running on.
    pub fn new(engine: Engine) -> Result<Self, TryCurrentError> {
        Ok(Self::with_handle(engine, Handle::try_current()?))
    }

    pub fn with_handle(engine: Engine, handle: Handle) -> Self {
        Self { engine, handle }
    }
}

impl TaskRunner for TokioTaskRunner {
    fn name(&self) -> &str {
        "tokio"
    }

    fn submit_request(&self, request: RunRequest) -> RunFuture {
        let run_id = request.run_id();
        let cancel = request.cancel_token().clone();
        let completion = Arc::new(Completion::new());

        let driver = AsyncEngine::new(self.engine.clone());
        let task = self.handle.spawn(async move { driver.run(request).await });
        let abort = task.abort_handle();

        let engine = self.engine.clone();
        let slot = Arc::clone(&completion);
        self.handle.spawn(async move {
            let state = match task.await {
                Ok(state) => state,
                Err(e) if e.is_cancelled() => {
                    debug!("Run {} was aborted", run_id);
                    report_abort(&engine, run_id).await
                }
                Err(e) => {
                    error!("Driver of run {} failed: {}", run_id, e);
                    State::crashed(TaskError::crash(format!("Run driver failed: {}", e)))
                }
            };
            slot.complete(state);
        });

        RunFuture::new(run_id, completion, Backend::Task { cancel, abort })
    }
}

/// Proposes `Crashed` for an aborted run and returns the state the
/// orchestrator settled on. A run that already finished keeps its state.
async fn report_abort(engine: &Engine, run_id: Uuid) -> State {
    let crashed = State::crashed(TaskError::crash("Run was aborted"));
    let client = Arc::clone(engine.client());
    let request = TransitionRequest::new(run_id, crashed.clone());
    match tokio::task::spawn_blocking(move || client.propose_transition(&request)).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => {
            warn!("Could not report abort of run {}: {}", run_id, e);
            crashed
        }
        Err(e) => {
            warn!("Reporting abort of run {} failed: {}", run_id, e);
            crashed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::config::Settings;
    use crate::engine::TaskDefinition;
    use crate::future::{wait_async, Inputs};
    use crate::orchestration::InMemoryOrchestrator;
    use crate::storage::MemoryStorage;
    use crate::transaction::IsolationLevel;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_submit_and_wait() {
        let runner = TokioTaskRunner::new(Engine::in_memory()).unwrap();
        let def = TaskDefinition::new_async("answer", |_ctx, _p| async { Ok(json!(42)) });

        let future = runner.submit(&def, Inputs::new());
        let outcome = future.result_async(true).await.unwrap();
        assert_eq!(outcome.value(), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_abort_resolves_crashed() {
        let runner = TokioTaskRunner::new(Engine::in_memory()).unwrap();
        let def = TaskDefinition::new_async("forever", |_ctx, _p| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        });

        let future = runner.submit(&def, Inputs::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        future.abort();

        let state = future.wait_async().await;
        assert!(state.is_crashed());
    }

    #[tokio::test]
    async fn test_abort_reports_crash_and_frees_key() {
        let orchestrator = InMemoryOrchestrator::new();
        let mut settings = Settings::default();
        settings.locks.acquire_timeout_secs = 2.0;
        let engine = Engine::builder()
            .client(Arc::new(orchestrator.clone()))
            .storage(Arc::new(MemoryStorage::new()))
            .settings(settings)
            .build();
        let runner = TokioTaskRunner::new(engine).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let def = TaskDefinition::new_async("guarded", move |_ctx, _p| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(json!("second"))
            }
        })
        .with_cache_policy(CachePolicy::inputs().with_isolation_level(IsolationLevel::Serializable));

        let first = runner.submit(&def, Inputs::new());
        tokio::time::sleep(Duration::from_millis(200)).await;
        first.abort();
        assert!(first.wait_async().await.is_crashed());
        let recorded = orchestrator
            .run(first.run_id())
            .and_then(|run| run.state)
            .unwrap();
        assert!(recorded.is_crashed());

        let started = Instant::now();
        let second = runner.submit(&def, Inputs::new());
        let value = second.result_async(true).await.unwrap().into_result().unwrap();
        assert_eq!(value, json!("second"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_many_runs_finish() {
        let runner = TokioTaskRunner::new(Engine::in_memory()).unwrap();
        let def = TaskDefinition::new_async("quick", |_ctx, _p| async { Ok(json!(1)) });
        let futures: Vec<_> = (0..8).map(|_| runner.submit(&def, Inputs::new())).collect();

        let result = wait_async(&futures, Some(Duration::from_secs(10))).await;
        assert_eq!(result.done.len(), 8);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(TokioTaskRunner::new(Engine::in_memory()).is_err());
    }
}
