//! Task Runners
//!
//! A task runner submits runs for concurrent execution and hands back a
//! [`RunFuture`] per run:
//!
//! - [`ThreadPoolTaskRunner`]: blocking engine on a fixed pool of worker threads
//! - [`TokioTaskRunner`]: tokio engine on a runtime handle
//! - [`ImmediateTaskRunner`]: runs inline in the caller
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrunner::engine::{Engine, TaskDefinition};
//! use flowrunner::executor::{MapArg, TaskRunner, ThreadPoolTaskRunner};
//! use flowrunner::future::{wait, Input};
//! use serde_json::json;
//! use std::collections::BTreeMap;
//!
//! let runner = ThreadPoolTaskRunner::new(Engine::in_memory(), 4);
//! let square = TaskDefinition::new("square", |_ctx, p| {
//!     let x = p["x"].as_i64().unwrap_or(0);
//!     Ok(json!(x * x))
//! });
//!
//! let mut args = BTreeMap::new();
//! args.insert(
//!     "x".to_string(),
//!     MapArg::Mapped((1..=3).map(|i| Input::Value(json!(i))).collect()),
//! );
//! let futures = runner.map(&square, args).unwrap();
//! assert_eq!(wait(&futures, None).done.len(), 3);
//! ```

mod immediate;
mod thread_pool;
mod tokio_runner;

pub use immediate::ImmediateTaskRunner;
pub use thread_pool::ThreadPoolTaskRunner;
pub use tokio_runner::TokioTaskRunner;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::engine::{RunRequest, TaskDefinition};
use crate::future::{Input, Inputs, RunFuture};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("mapped argument '{name}' has {found} items, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("map needs at least one mapped argument")]
    NothingToMap,
}

/// One argument of a mapped submission.
#[derive(Debug, Clone)]
pub enum MapArg {
    /// Iterated element-wise, one element per run
    Mapped(Vec<Input>),
    /// Passed unchanged to every run
    Unmapped(Input),
}

/// Expands mapped arguments into the inputs of each run.
///
/// Every mapped argument must have the same length.
pub fn expand_map_args(args: BTreeMap<String, MapArg>) -> Result<Vec<Inputs>, MapError> {
    let mut expected: Option<usize> = None;
    for (name, arg) in &args {
        if let MapArg::Mapped(items) = arg {
            match expected {
                None => expected = Some(items.len()),
                Some(len) if len != items.len() => {
                    return Err(MapError::LengthMismatch {
                        name: name.clone(),
                        expected: len,
                        found: items.len(),
                    })
                }
                Some(_) => {}
            }
        }
    }
    let len = expected.ok_or(MapError::NothingToMap)?;

    Ok((0..len)
        .map(|i| {
            args.iter()
                .map(|(name, arg)| {
                    let input = match arg {
                        MapArg::Mapped(items) => items[i].clone(),
                        MapArg::Unmapped(input) => input.clone(),
                    };
                    (name.clone(), input)
                })
                .collect()
        })
        .collect())
}

/// Submits runs for execution.
pub trait TaskRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Starts executing `request` and returns its future.
    fn submit_request(&self, request: RunRequest) -> RunFuture;

    /// Submits a top-level run of `definition` with the given inputs.
    fn submit(&self, definition: &TaskDefinition, inputs: Inputs) -> RunFuture {
        self.submit_request(RunRequest::new(definition.clone()).with_inputs(inputs))
    }

    /// Submits one run per element of the mapped arguments.
    ///
    /// Fails before submitting anything if the mapped lengths differ.
    fn map(
        &self,
        definition: &TaskDefinition,
        args: BTreeMap<String, MapArg>,
    ) -> Result<Vec<RunFuture>, MapError> {
        let calls = expand_map_args(args)?;
        Ok(calls
            .into_iter()
            .map(|inputs| self.submit(definition, inputs))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(items: &[i64]) -> MapArg {
        MapArg::Mapped(items.iter().map(|i| Input::Value(json!(i))).collect())
    }

    #[test]
    fn test_expand_pairs_elements() {
        let mut args = BTreeMap::new();
        args.insert("x".to_string(), values(&[1, 2, 3]));
        args.insert("y".to_string(), values(&[10, 20, 30]));
        args.insert("scale".to_string(), MapArg::Unmapped(Input::Value(json!(2))));

        let calls = expand_map_args(args).unwrap();
        assert_eq!(calls.len(), 3);
        match (&calls[1]["x"], &calls[1]["y"], &calls[1]["scale"]) {
            (Input::Value(x), Input::Value(y), Input::Value(s)) => {
                assert_eq!((x, y, s), (&json!(2), &json!(20), &json!(2)));
            }
            other => panic!("unexpected inputs {:?}", other),
        }
    }

    #[test]
    fn test_expand_rejects_length_mismatch() {
        let mut args = BTreeMap::new();
        args.insert("a".to_string(), values(&[1, 2]));
        args.insert("b".to_string(), values(&[1, 2, 3]));

        assert_eq!(
            expand_map_args(args).unwrap_err(),
            MapError::LengthMismatch {
                name: "b".to_string(),
                expected: 2,
                found: 3,
            }
        );
    }

    #[test]
    fn test_expand_requires_a_mapped_argument() {
        let mut args = BTreeMap::new();
        args.insert("only".to_string(), MapArg::Unmapped(Input::Value(json!(1))));
        assert_eq!(expand_map_args(args).unwrap_err(), MapError::NothingToMap);
    }

    #[test]
    fn test_expand_empty_mapped_argument() {
        let mut args = BTreeMap::new();
        args.insert("x".to_string(), values(&[]));
        assert!(expand_map_args(args).unwrap().is_empty());
    }
}
