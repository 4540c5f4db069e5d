//! Input Resolution
//!
//! Run inputs may be plain values, futures, or nested lists, tuples and
//! maps of either. Resolution finds every distinct future in the tree,
//! waits for each once, and substitutes its state or value back in.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RunError, TaskError};
use crate::run::Parameters;
use crate::state::State;

use super::RunFuture;

/// A run input that may reference other runs' futures.
#[derive(Debug, Clone)]
pub enum Input {
    Value(Value),
    Future(RunFuture),
    List(Vec<Input>),
    Tuple(Vec<Input>),
    Map(BTreeMap<String, Input>),
}

/// Named run inputs.
pub type Inputs = BTreeMap<String, Input>;

/// How deeply lists, tuples and maps may nest inside one input.
pub const MAX_INPUT_DEPTH: usize = 512;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Tears the tree down with an explicit stack so deep inputs cannot
/// overflow the thread's stack when dropped.
impl Drop for Input {
    fn drop(&mut self) {
        let mut stack = Vec::new();
        take_children(self, &mut stack);
        while let Some(mut input) = stack.pop() {
            take_children(&mut input, &mut stack);
        }
    }
}

fn take_children(input: &mut Input, out: &mut Vec<Input>) {
    match input {
        Input::List(items) | Input::Tuple(items) => out.append(items),
        Input::Map(map) => out.extend(std::mem::take(map).into_values()),
        Input::Value(_) | Input::Future(_) => {}
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<RunFuture> for Input {
    fn from(future: RunFuture) -> Self {
        Self::Future(future)
    }
}

impl From<&RunFuture> for Input {
    fn from(future: &RunFuture) -> Self {
        Self::Future(future.clone())
    }
}

impl From<Vec<Input>> for Input {
    fn from(items: Vec<Input>) -> Self {
        Self::List(items)
    }
}

/// An input tree with each future replaced by its final state.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedTree {
    Value(Value),
    State(State),
    List(Vec<ResolvedTree>),
    Tuple(Vec<ResolvedTree>),
    Map(BTreeMap<String, ResolvedTree>),
}

/// Collects distinct futures without recursing on the call stack.
///
/// Fails before anything is waited on if the tree nests deeper than
/// [`MAX_INPUT_DEPTH`].
fn collect_futures<'a>(
    roots: impl IntoIterator<Item = &'a Input>,
) -> Result<Vec<RunFuture>, RunError> {
    let mut stack: Vec<(&Input, usize)> = roots.into_iter().map(|i| (i, 0)).collect();
    let mut seen = HashMap::new();
    let mut order = Vec::new();

    while let Some((input, depth)) = stack.pop() {
        if depth > MAX_INPUT_DEPTH {
            return Err(RunError::InputTooDeep(MAX_INPUT_DEPTH));
        }
        match input {
            Input::Value(_) => {}
            Input::Future(f) => {
                if seen.insert(f.run_id(), ()).is_none() {
                    order.push(f.clone());
                }
            }
            Input::List(items) | Input::Tuple(items) => {
                stack.extend(items.iter().map(|i| (i, depth + 1)))
            }
            Input::Map(map) => stack.extend(map.values().map(|i| (i, depth + 1))),
        }
    }
    Ok(order)
}

fn wait_all(futures: Vec<RunFuture>) -> HashMap<Uuid, State> {
    futures
        .into_iter()
        .filter_map(|f| f.wait(None).map(|state| (f.run_id(), state)))
        .collect()
}

fn cancelled_while_waiting() -> TaskError {
    TaskError::cancelled("Run was cancelled while waiting for upstream runs")
}

/// Like [`wait_all`], but gives up once `cancel` fires.
fn wait_all_or_cancel(
    futures: Vec<RunFuture>,
    cancel: &CancellationToken,
) -> Result<HashMap<Uuid, State>, TaskError> {
    let mut states = HashMap::with_capacity(futures.len());
    for future in futures {
        let state = loop {
            if let Some(state) = future.wait(Some(CANCEL_POLL)) {
                break state;
            }
            if cancel.is_cancelled() {
                return Err(cancelled_while_waiting());
            }
        };
        states.insert(future.run_id(), state);
    }
    Ok(states)
}

async fn wait_all_async(futures: Vec<RunFuture>) -> HashMap<Uuid, State> {
    let states = futures::future::join_all(futures.iter().map(|f| f.wait_async())).await;
    futures
        .iter()
        .map(|f| f.run_id())
        .zip(states)
        .collect()
}

fn substitute_states(input: &Input, states: &HashMap<Uuid, State>) -> ResolvedTree {
    match input {
        Input::Value(v) => ResolvedTree::Value(v.clone()),
        Input::Future(f) => match states.get(&f.run_id()) {
            Some(state) => ResolvedTree::State(state.clone()),
            None => ResolvedTree::Value(Value::Null),
        },
        Input::List(items) => {
            ResolvedTree::List(items.iter().map(|i| substitute_states(i, states)).collect())
        }
        Input::Tuple(items) => {
            ResolvedTree::Tuple(items.iter().map(|i| substitute_states(i, states)).collect())
        }
        Input::Map(map) => ResolvedTree::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_states(v, states)))
                .collect(),
        ),
    }
}

fn substitute_values(
    input: &Input,
    states: &HashMap<Uuid, State>,
    raise_on_failure: bool,
) -> Result<Value, RunError> {
    Ok(match input {
        Input::Value(v) => v.clone(),
        Input::Future(f) => {
            let state = states
                .get(&f.run_id())
                .ok_or(RunError::WaitTimeout(std::time::Duration::ZERO))?;
            match state.result(raise_on_failure)?.into_result() {
                Ok(value) => value,
                Err(err) => serde_json::to_value(err.failure()).unwrap_or(Value::Null),
            }
        }
        Input::List(items) | Input::Tuple(items) => Value::Array(
            items
                .iter()
                .map(|i| substitute_values(i, states, raise_on_failure))
                .collect::<Result<_, _>>()?,
        ),
        Input::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), substitute_values(v, states, raise_on_failure)?)))
                .collect::<Result<_, RunError>>()?,
        ),
    })
}

/// Waits for every future in `input` and returns the tree of final states.
pub fn resolve_futures_to_states(input: &Input) -> Result<ResolvedTree, RunError> {
    let states = wait_all(collect_futures([input])?);
    Ok(substitute_states(input, &states))
}

pub async fn resolve_futures_to_states_async(input: &Input) -> Result<ResolvedTree, RunError> {
    let states = wait_all_async(collect_futures([input])?).await;
    Ok(substitute_states(input, &states))
}

/// Waits for every future in `input` and returns plain values.
///
/// Lists and tuples become JSON arrays and maps become objects. With
/// `raise_on_failure`, the first failed upstream run is returned as an
/// error; without it, its failure is substituted as a value.
pub fn resolve_futures_to_results(input: &Input, raise_on_failure: bool) -> Result<Value, RunError> {
    let states = wait_all(collect_futures([input])?);
    substitute_values(input, &states, raise_on_failure)
}

pub async fn resolve_futures_to_results_async(
    input: &Input,
    raise_on_failure: bool,
) -> Result<Value, RunError> {
    let states = wait_all_async(collect_futures([input])?).await;
    substitute_values(input, &states, raise_on_failure)
}

fn check_upstream(states: &HashMap<Uuid, State>) -> Result<(), TaskError> {
    let mut failed: Vec<(&Uuid, &State)> = states.iter().filter(|(_, s)| !s.is_completed()).collect();
    failed.sort_by_key(|(id, _)| **id);
    match failed.first() {
        Some((id, state)) => Err(TaskError::upstream(format!(
            "Upstream run {} finished in state {} and its result is not available",
            id, state
        ))),
        None => Ok(()),
    }
}

fn collect_input_futures(inputs: &Inputs) -> Result<Vec<RunFuture>, TaskError> {
    collect_futures(inputs.values()).map_err(|e| TaskError::validation(e.to_string()))
}

/// Resolves named run inputs into parameters.
///
/// Any upstream run that did not complete fails resolution with an
/// `Upstream` error, so the dependent run never starts its body.
pub fn resolve_inputs(inputs: &Inputs) -> Result<Parameters, TaskError> {
    resolve_inputs_or_cancel(inputs, &CancellationToken::new())
}

/// Resolves named run inputs, returning a `Cancelled` error if `cancel`
/// fires while an upstream run is still going.
pub fn resolve_inputs_or_cancel(
    inputs: &Inputs,
    cancel: &CancellationToken,
) -> Result<Parameters, TaskError> {
    let states = wait_all_or_cancel(collect_input_futures(inputs)?, cancel)?;
    inputs_from_states(inputs, &states)
}

pub async fn resolve_inputs_async(inputs: &Inputs) -> Result<Parameters, TaskError> {
    resolve_inputs_or_cancel_async(inputs, &CancellationToken::new()).await
}

pub async fn resolve_inputs_or_cancel_async(
    inputs: &Inputs,
    cancel: &CancellationToken,
) -> Result<Parameters, TaskError> {
    let futures = collect_input_futures(inputs)?;
    let states = tokio::select! {
        biased;
        states = wait_all_async(futures) => states,
        _ = cancel.cancelled() => return Err(cancelled_while_waiting()),
    };
    inputs_from_states(inputs, &states)
}

fn inputs_from_states(
    inputs: &Inputs,
    states: &HashMap<Uuid, State>,
) -> Result<Parameters, TaskError> {
    check_upstream(states)?;
    inputs
        .iter()
        .map(|(name, input)| {
            substitute_values(input, states, true)
                .map(|value| (name.clone(), value))
                .map_err(|e| TaskError::upstream(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::{Backend, Completion};
    use serde_json::json;
    use std::sync::Arc;

    fn done(value: Value) -> RunFuture {
        RunFuture::ready(Uuid::new_v4(), State::completed(value))
    }

    #[test]
    fn test_resolves_nested_values() {
        let a = done(json!(1));
        let b = done(json!("two"));
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Input::from(&b));
        map.insert("lit".to_string(), Input::Value(json!(true)));

        let input = Input::List(vec![
            Input::from(&a),
            Input::Tuple(vec![Input::from(&a), Input::Map(map)]),
        ]);

        let value = resolve_futures_to_results(&input, true).unwrap();
        assert_eq!(value, json!([1, [1, {"b": "two", "lit": true}]]));
    }

    #[test]
    fn test_collects_each_future_once() {
        let a = done(json!(1));
        let input = Input::List(vec![Input::from(&a), Input::from(&a), Input::from(&a)]);
        assert_eq!(collect_futures([&input]).unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_to_states() {
        let a = done(json!(1));
        let tree = resolve_futures_to_states(&Input::List(vec![Input::from(&a)])).unwrap();
        match tree {
            ResolvedTree::List(items) => match &items[0] {
                ResolvedTree::State(state) => assert!(state.is_completed()),
                other => panic!("expected a state, got {:?}", other),
            },
            other => panic!("expected a list, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_upstream_raises() {
        let bad = RunFuture::ready(Uuid::new_v4(), State::failed(TaskError::msg("nope")));
        let input = Input::from(&bad);
        assert!(resolve_futures_to_results(&input, true).is_err());

        let value = resolve_futures_to_results(&input, false).unwrap();
        assert_eq!(value["message"], json!("nope"));
    }

    #[test]
    fn test_resolve_inputs_reports_upstream_failure() {
        let bad = RunFuture::ready(Uuid::new_v4(), State::crashed(TaskError::crash("lost")));
        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Input::from(&bad));
        inputs.insert("y".to_string(), Input::Value(json!(2)));

        let err = resolve_inputs(&inputs).unwrap_err();
        assert_eq!(err.kind, crate::error::FailureKind::Upstream);
    }

    #[test]
    fn test_resolve_inputs_plain() {
        let up = done(json!(41));
        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Input::from(&up));
        inputs.insert("y".to_string(), Input::Value(json!(1)));

        let params = resolve_inputs(&inputs).unwrap();
        assert_eq!(params["x"], json!(41));
        assert_eq!(params["y"], json!(1));
    }

    #[tokio::test]
    async fn test_resolve_inputs_async() {
        let up = done(json!("v"));
        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Input::List(vec![Input::from(&up), Input::from(&up)]));
        let params = resolve_inputs_async(&inputs).await.unwrap();
        assert_eq!(params["x"], json!(["v", "v"]));
    }

    fn nested(depth: usize) -> Input {
        let mut input = Input::Value(json!(0));
        for _ in 0..depth {
            input = Input::List(vec![input]);
        }
        input
    }

    #[test]
    fn test_deep_input_is_rejected() {
        let input = nested(100_000);
        assert!(matches!(
            resolve_futures_to_results(&input, true),
            Err(RunError::InputTooDeep(MAX_INPUT_DEPTH))
        ));
        assert!(resolve_futures_to_states(&input).is_err());

        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), input);
        let err = resolve_inputs(&inputs).unwrap_err();
        assert_eq!(err.kind, crate::error::FailureKind::Validation);
    }

    #[test]
    fn test_input_at_depth_limit_resolves() {
        let value = resolve_futures_to_results(&nested(MAX_INPUT_DEPTH), true).unwrap();
        let mut depth = 0;
        let mut cursor = &value;
        while let Value::Array(items) = cursor {
            depth += 1;
            cursor = &items[0];
        }
        assert_eq!(depth, MAX_INPUT_DEPTH);
    }

    fn pending_future() -> (RunFuture, Arc<Completion>) {
        let completion = Arc::new(Completion::new());
        let future = RunFuture::new(
            Uuid::new_v4(),
            Arc::clone(&completion),
            Backend::Thread {
                cancel: CancellationToken::new(),
            },
        );
        (future, completion)
    }

    #[test]
    fn test_cancel_stops_waiting_on_upstream() {
        let (upstream, _completion) = pending_future();
        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Input::from(&upstream));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = resolve_inputs_or_cancel(&inputs, &cancel).unwrap_err();
        assert_eq!(err.kind, crate::error::FailureKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_stops_async_wait_on_upstream() {
        let (upstream, _completion) = pending_future();
        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Input::from(&upstream));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = resolve_inputs_or_cancel_async(&inputs, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::FailureKind::Cancelled);
    }
}
