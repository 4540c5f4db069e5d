//! End-to-end behavior of the run engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use flowrunner::cache::CachePolicy;
use flowrunner::engine::{Engine, RunRequest, TaskDefinition};
use flowrunner::error::{FailureKind, RunError, TaskError};
use flowrunner::future::Input;
use flowrunner::orchestration::{
    ClientError, InMemoryOrchestrator, OrchestrationClient, RunCreate, TransitionRequest,
};
use flowrunner::retry::RetryDelay;
use flowrunner::run::Run;
use flowrunner::state::{State, StateType, TIMED_OUT};
use flowrunner::storage::MemoryStorage;
use flowrunner::{RunFuture, Settings};
use serde_json::json;
use uuid::Uuid;

fn engine_with(orchestrator: &InMemoryOrchestrator) -> Engine {
    Engine::builder()
        .client(Arc::new(orchestrator.clone()))
        .storage(Arc::new(MemoryStorage::new()))
        .build()
}

fn counting_task(name: &str, calls: &Arc<AtomicUsize>) -> TaskDefinition {
    let calls = Arc::clone(calls);
    TaskDefinition::new(name, move |_, p| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!(p["x"].as_i64().unwrap_or(0) * 2))
    })
}

#[test]
fn test_inputs_policy_hits_cache_on_second_call() {
    let orchestrator = InMemoryOrchestrator::new();
    let engine = engine_with(&orchestrator);
    let calls = Arc::new(AtomicUsize::new(0));
    let def = counting_task("double", &calls).with_cache_policy(CachePolicy::inputs());

    let first = engine.run(RunRequest::new(def.clone()).with_param("x", json!(5)));
    let second = engine.run(RunRequest::new(def.clone()).with_param("x", json!(5)));

    assert_eq!(first.value().unwrap(), json!(10));
    assert!(!first.is_cached());
    assert_eq!(second.value().unwrap(), json!(10));
    assert!(second.is_cached());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Different inputs mean a different key
    engine.run(RunRequest::new(def).with_param("x", json!(6)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_excluded_input_does_not_change_key() {
    let engine = Engine::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));
    let def = counting_task("double", &calls)
        .with_cache_policy(CachePolicy::inputs().without_input("verbose"));

    engine.run(
        RunRequest::new(def.clone())
            .with_param("x", json!(1))
            .with_param("verbose", json!(true)),
    );
    let second = engine.run(
        RunRequest::new(def)
            .with_param("x", json!(1))
            .with_param("verbose", json!(false)),
    );
    assert!(second.is_cached());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_expired_record_is_a_miss() {
    let engine = Engine::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));
    let def = counting_task("short-lived", &calls)
        .with_cache_policy(CachePolicy::inputs())
        .with_cache_expiration(Duration::from_millis(50));

    engine.run(RunRequest::new(def.clone()).with_param("x", json!(1)));
    thread::sleep(Duration::from_millis(120));
    let second = engine.run(RunRequest::new(def).with_param("x", json!(1)));

    assert!(!second.is_cached());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_retry_schedule_gives_four_attempts_with_growing_delays() {
    let orchestrator = InMemoryOrchestrator::new();
    let engine = engine_with(&orchestrator);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let def = TaskDefinition::new("always-fails", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::new("ValueError", "nope"))
    })
    .with_retries(3)
    .with_retry_delay(RetryDelay::Schedule(vec![
        Duration::from_millis(100),
        Duration::from_millis(200),
        Duration::from_millis(400),
    ]));

    let request = RunRequest::new(def);
    let run_id = request.run_id();
    let state = engine.run(request);

    assert!(state.is_failed());
    assert_eq!(state.failure().unwrap().type_name, "ValueError");
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let history = orchestrator.history();
    assert_eq!(history.count(run_id, StateType::Running), 4);
    let delays = history.retry_delays(run_id);
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(delays[2] >= Duration::from_millis(300));
}

#[test]
fn test_retry_condition_stops_retries() {
    let engine = Engine::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let def = TaskDefinition::new("picky", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::new("PermissionError", "denied"))
    })
    .with_retries(5)
    .with_retry_condition(|failure| failure.type_name != "PermissionError");

    assert!(engine.run(RunRequest::new(def)).is_failed());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failure_hooks_fire_once_after_retries() {
    let engine = Engine::in_memory();
    let failures = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let (f, r) = (Arc::clone(&failures), Arc::clone(&running));

    let def = TaskDefinition::new("flaky", |_, _| Err(TaskError::msg("still broken")))
        .with_retries(2)
        .on_failure(move |_, state| {
            assert!(state.is_failed());
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .on_running(move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    engine.run(RunRequest::new(def));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(running.load(Ordering::SeqCst), 3);
}

#[test]
fn test_hook_errors_are_isolated() {
    let engine = Engine::in_memory();
    let def = TaskDefinition::new("ok", |_, _| Ok(json!(1)))
        .on_completion(|_, _| Err("hook broke".into()))
        .on_completion(|_, _| panic!("hook panicked"));

    let state = engine.run(RunRequest::new(def));
    assert_eq!(state.value().unwrap(), json!(1));
}

#[test]
fn test_timeout_yields_timed_out() {
    let engine = Engine::in_memory();
    let def = TaskDefinition::new("slow", |ctx, _| {
        for _ in 0..200 {
            if ctx.is_cancelled() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(json!("late"))
    })
    .with_timeout(Duration::from_millis(200));

    let state = engine.run(RunRequest::new(def));
    assert!(state.is_failed());
    assert_eq!(state.name(), TIMED_OUT);
    assert_eq!(state.message(), Some("Run exceeded timeout of 0.2 second(s)"));

    match state.value().unwrap_err() {
        RunError::Failed(failure) => assert_eq!(failure.kind, FailureKind::Timeout),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_result_without_raise_returns_failure() {
    let engine = Engine::in_memory();
    let def = TaskDefinition::new("bad", |_, _| Err(TaskError::new("ValueError", "x")));
    let request = RunRequest::new(def);
    let future = RunFuture::ready(request.run_id(), engine.run(request));

    let outcome = future.result(None, false).unwrap();
    let failure = outcome.error().and_then(|e| e.failure()).unwrap();
    assert_eq!(failure.type_name, "ValueError");
    assert_eq!(failure.message, "x");

    assert!(matches!(future.result(None, true), Err(RunError::Failed(_))));
}

#[test]
fn test_missing_parameter_fails_without_running() {
    let orchestrator = InMemoryOrchestrator::new();
    let engine = engine_with(&orchestrator);
    let calls = Arc::new(AtomicUsize::new(0));
    let def = counting_task("needs-x", &calls).param("x").with_retries(3);

    let request = RunRequest::new(def);
    let run_id = request.run_id();
    let state = engine.run(request);

    assert!(state.is_failed());
    assert_eq!(state.failure().unwrap().kind, FailureKind::Validation);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        orchestrator.history().state_types(run_id),
        vec![StateType::Pending, StateType::Failed]
    );
}

#[test]
fn test_failed_upstream_fails_dependent_without_running() {
    let engine = Engine::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));
    let upstream = RunFuture::ready(Uuid::new_v4(), State::failed(TaskError::msg("broken")));
    let def = counting_task("downstream", &calls).with_retries(2);

    let state = engine.run(RunRequest::new(def).with_input("x", Input::from(&upstream)));
    assert!(state.is_failed());
    assert_eq!(state.failure().unwrap().kind, FailureKind::Upstream);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_flow_runs_nested_tasks() {
    let orchestrator = InMemoryOrchestrator::new();
    let engine = engine_with(&orchestrator);
    let add_one = TaskDefinition::new("add-one", |_, p| {
        Ok(json!(p["x"].as_i64().unwrap_or(0) + 1))
    })
    .param("x");

    let inner = add_one.clone();
    let flow = TaskDefinition::flow("pipeline", move |ctx, p| {
        let mut x = p["start"].clone();
        for _ in 0..3 {
            let mut params = flowrunner::Parameters::new();
            params.insert("x".to_string(), x);
            x = ctx.run_task(&inner, params)?;
        }
        Ok(x)
    });

    let request = RunRequest::new(flow).with_param("start", json!(10));
    let flow_id = request.run_id();
    let state = engine.run(request);

    assert_eq!(state.value().unwrap(), json!(13));
    let children = orchestrator.children_of(flow_id);
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|run: &Run| run.is_finished()));
}

#[test]
fn test_nested_failure_propagates_to_flow() {
    let engine = Engine::in_memory();
    let broken = TaskDefinition::new("broken", |_, _| Err(TaskError::new("KeyError", "k")));
    let flow = TaskDefinition::flow("outer", move |ctx, _| {
        ctx.run_task(&broken, Default::default())?;
        Ok(json!("unreachable"))
    });

    let state = engine.run(RunRequest::new(flow));
    assert!(state.is_failed());
    assert_eq!(state.failure().unwrap().type_name, "KeyError");
}

/// Forwards to an orchestrator but loses the first response to each
/// transition proposal, as a dropped connection would.
#[derive(Debug)]
struct LossyClient {
    inner: InMemoryOrchestrator,
    seen: Mutex<Vec<Uuid>>,
}

impl OrchestrationClient for LossyClient {
    fn create_run(&self, run: RunCreate) -> Result<Uuid, ClientError> {
        self.inner.create_run(run)
    }

    fn propose_transition(&self, request: &TransitionRequest) -> Result<State, ClientError> {
        let answer = self.inner.propose_transition(request)?;
        let mut seen = self.seen.lock().unwrap();
        if seen.contains(&request.idempotency_key) {
            Ok(answer)
        } else {
            seen.push(request.idempotency_key);
            Err(ClientError::Transient("connection reset".to_string()))
        }
    }

    fn read_state(&self, run_id: Uuid) -> Result<Option<State>, ClientError> {
        self.inner.read_state(run_id)
    }

    fn read_run(&self, run_id: Uuid) -> Result<Run, ClientError> {
        self.inner.read_run(run_id)
    }
}

#[test]
fn test_resent_proposal_is_applied_once() {
    let orchestrator = InMemoryOrchestrator::new();
    let mut settings = Settings::default();
    settings.client.backoff_base_ms = 1;
    let engine = Engine::builder()
        .client(Arc::new(LossyClient {
            inner: orchestrator.clone(),
            seen: Mutex::new(Vec::new()),
        }))
        .storage(Arc::new(MemoryStorage::new()))
        .settings(settings)
        .build();

    let def = TaskDefinition::new("steady", |_, _| Ok(json!("ok")));
    let request = RunRequest::new(def);
    let run_id = request.run_id();
    let state = engine.run(request);

    assert_eq!(state.value().unwrap(), json!("ok"));
    assert_eq!(
        orchestrator.history().state_types(run_id),
        vec![StateType::Pending, StateType::Running, StateType::Completed]
    );
    assert_eq!(orchestrator.run(run_id).unwrap().run_count, 1);
}

/// Always unreachable.
#[derive(Debug)]
struct DownClient;

impl OrchestrationClient for DownClient {
    fn create_run(&self, run: RunCreate) -> Result<Uuid, ClientError> {
        Ok(run.id)
    }

    fn propose_transition(&self, _: &TransitionRequest) -> Result<State, ClientError> {
        Err(ClientError::Transient("down".to_string()))
    }

    fn read_state(&self, _: Uuid) -> Result<Option<State>, ClientError> {
        Err(ClientError::Transient("down".to_string()))
    }

    fn read_run(&self, run_id: Uuid) -> Result<Run, ClientError> {
        Err(ClientError::RunNotFound(run_id))
    }
}

#[test]
fn test_unreachable_orchestrator_crashes_run() {
    let mut settings = Settings::default();
    settings.client.max_retries = 2;
    settings.client.backoff_base_ms = 1;
    let engine = Engine::builder()
        .client(Arc::new(DownClient))
        .storage(Arc::new(MemoryStorage::new()))
        .settings(settings)
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let state = engine.run(RunRequest::new(counting_task("never", &calls)));
    assert!(state.is_crashed());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
