//! Cache isolation and transaction scopes seen through whole runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use flowrunner::cache::CachePolicy;
use flowrunner::engine::{Engine, RunRequest, TaskDefinition};
use flowrunner::error::TaskError;
use flowrunner::orchestration::InMemoryOrchestrator;
use flowrunner::storage::MemoryStorage;
use flowrunner::transaction::{IsolationLevel, TxnOptions};
use flowrunner::{Parameters, Settings};
use serde_json::{json, Value};

fn slow_counter(calls: &Arc<AtomicUsize>, policy: CachePolicy) -> TaskDefinition {
    let calls = Arc::clone(calls);
    TaskDefinition::new("expensive", move |_, p| {
        calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        Ok(json!(p["x"].as_i64().unwrap_or(0) + 100))
    })
    .with_cache_policy(policy)
}

fn race(engine: &Engine, def: &TaskDefinition) -> Vec<Value> {
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            let def = def.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine
                    .execute(RunRequest::new(def).with_param("x", json!(1)))
                    .unwrap()
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_serializable_runs_execute_once() {
    let engine = Engine::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));
    let def = slow_counter(
        &calls,
        CachePolicy::inputs().with_isolation_level(IsolationLevel::Serializable),
    );

    let values = race(&engine, &def);
    assert_eq!(values, vec![json!(101), json!(101)]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_read_committed_runs_both_execute() {
    let engine = Engine::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));
    let def = slow_counter(&calls, CachePolicy::inputs());

    let values = race(&engine, &def);
    assert_eq!(values, vec![json!(101), json!(101)]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

struct Counters {
    body: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
    rollbacks: Arc<AtomicUsize>,
}

fn hooked_writer() -> (TaskDefinition, Counters) {
    let counters = Counters {
        body: Arc::new(AtomicUsize::new(0)),
        commits: Arc::new(AtomicUsize::new(0)),
        rollbacks: Arc::new(AtomicUsize::new(0)),
    };
    let (body, commits, rollbacks) = (
        Arc::clone(&counters.body),
        Arc::clone(&counters.commits),
        Arc::clone(&counters.rollbacks),
    );
    let def = TaskDefinition::new("writer", move |_, p| {
        body.fetch_add(1, Ordering::SeqCst);
        Ok(p["x"].clone())
    })
    .with_cache_policy(CachePolicy::inputs())
    .on_commit(move |_| {
        commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .on_rollback(move |_| {
        rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (def, counters)
}

fn params(x: i64) -> Parameters {
    let mut params = Parameters::new();
    params.insert("x".to_string(), json!(x));
    params
}

#[test]
fn test_rolled_back_scope_discards_nested_writes() {
    let engine = Engine::in_memory();
    let (writer, counters) = hooked_writer();

    let inner = writer.clone();
    let flow = TaskDefinition::flow("abandon", move |ctx, _| {
        let scoped = ctx.transaction(TxnOptions::new(), |scope| {
            scope.run_task(&inner, params(7))?;
            Err::<(), _>(TaskError::msg("abandon scope"))
        });
        assert!(scoped.is_err());
        Ok(json!("handled"))
    });

    assert_eq!(engine.execute(RunRequest::new(flow)).unwrap(), json!("handled"));
    assert_eq!(counters.body.load(Ordering::SeqCst), 1);
    assert_eq!(counters.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(counters.commits.load(Ordering::SeqCst), 0);

    // Nothing was persisted, so the writer runs again
    let state = engine.run(RunRequest::new(writer).with_parameters(params(7)));
    assert!(!state.is_cached());
    assert_eq!(counters.body.load(Ordering::SeqCst), 2);
    assert_eq!(counters.commits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_nested_run_rolls_back_earlier_writes() {
    let engine = Engine::in_memory();
    let (writer, counters) = hooked_writer();
    let broken = TaskDefinition::new("broken", |_, _| Err(TaskError::msg("disk full")));

    let inner = writer.clone();
    let flow = TaskDefinition::flow("partial", move |ctx, _| {
        let scoped = ctx.transaction(TxnOptions::new(), |scope| {
            assert_eq!(scope.run_task(&inner, params(7))?, json!(7));
            scope.run_task(&broken, Parameters::new())?;
            Ok(())
        });
        let err = scoped.unwrap_err();
        assert_eq!(err.message, "disk full");
        Ok(json!("recovered"))
    });

    assert_eq!(engine.execute(RunRequest::new(flow)).unwrap(), json!("recovered"));
    assert_eq!(counters.body.load(Ordering::SeqCst), 1);
    assert_eq!(counters.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(counters.commits.load(Ordering::SeqCst), 0);

    let state = engine.run(RunRequest::new(writer).with_parameters(params(7)));
    assert!(!state.is_cached());
    assert_eq!(counters.body.load(Ordering::SeqCst), 2);
}

#[test]
fn test_nested_serializable_runs_do_not_wait_on_each_other() {
    let mut settings = Settings::default();
    settings.locks.acquire_timeout_secs = 2.0;
    let engine = Engine::builder()
        .client(Arc::new(InMemoryOrchestrator::new()))
        .storage(Arc::new(MemoryStorage::new()))
        .settings(settings)
        .build();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let locked = TaskDefinition::new("locked", move |_, p| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(p["x"].clone())
    })
    .with_cache_policy(CachePolicy::inputs().with_isolation_level(IsolationLevel::Serializable));

    let flow = TaskDefinition::flow("twice", move |ctx, _| {
        ctx.transaction(TxnOptions::new(), |scope| {
            let first = scope.run_task(&locked, params(9))?;
            let started = Instant::now();
            let second = scope.run_task(&locked, params(9))?;
            Ok(json!([first, second, started.elapsed().as_millis() as u64]))
        })
    });

    let value = engine.execute(RunRequest::new(flow)).unwrap();
    assert_eq!(value[0], json!(9));
    assert_eq!(value[1], json!(9));
    assert!(value[2].as_u64().unwrap() < 1_000, "second run waited {}ms", value[2]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_committed_scope_persists_with_flow() {
    let engine = Engine::in_memory();
    let (writer, counters) = hooked_writer();

    let inner = writer.clone();
    let flow = TaskDefinition::flow("keep", move |ctx, _| {
        ctx.transaction(TxnOptions::new(), |scope| {
            scope.run_task(&inner, params(3))?;
            scope.run_task(&inner, params(4))?;
            Ok(())
        })?;
        Ok(json!("kept"))
    });

    assert_eq!(engine.execute(RunRequest::new(flow)).unwrap(), json!("kept"));
    assert_eq!(counters.commits.load(Ordering::SeqCst), 2);
    assert_eq!(counters.rollbacks.load(Ordering::SeqCst), 0);

    let state = engine.run(RunRequest::new(writer).with_parameters(params(4)));
    assert!(state.is_cached());
    assert_eq!(state.value().unwrap(), json!(4));
    assert_eq!(counters.body.load(Ordering::SeqCst), 2);
}

#[test]
fn test_scope_values_are_visible_to_nested_runs() {
    let engine = Engine::in_memory();
    let reader = TaskDefinition::new("reader", |ctx, _| {
        Ok(ctx.get("region").unwrap_or(Value::Null))
    });

    let flow = TaskDefinition::flow("configure", move |ctx, _| {
        ctx.transaction(TxnOptions::new(), |scope| {
            scope.set("region", json!("eu-west"))?;
            Ok(scope.run_task(&reader, Parameters::new())?)
        })
    });

    assert_eq!(engine.execute(RunRequest::new(flow)).unwrap(), json!("eu-west"));
}
