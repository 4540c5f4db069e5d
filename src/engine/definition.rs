//! Task and Flow Definitions
//!
//! A [`TaskDefinition`] is the declared unit of work: its body plus the
//! policies (retries, timeout, caching, hooks) the engine applies around
//! every run of it.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::cache::CachePolicy;
use crate::config::TaskSettings;
use crate::error::TaskError;
use crate::retry::{RetryCondition, RetryDelay, RetryPolicy};
use crate::run::{Parameters, RunKind};
use crate::state::State;
use crate::transaction::{Transaction, TxnHook};

use super::context::RunContext;

pub type SyncBody = Arc<dyn Fn(&RunContext, &Parameters) -> Result<Value, TaskError> + Send + Sync>;

pub type AsyncBody = Arc<
    dyn Fn(RunContext, Parameters) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync,
>;

/// The user code a definition runs.
#[derive(Clone)]
pub enum TaskBody {
    Sync(SyncBody),
    Async(AsyncBody),
}

impl TaskBody {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

/// Callback fired on a run state change.
pub type StateHook =
    Arc<dyn Fn(&RunContext, &State) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync>;

/// State-change hooks of a definition.
#[derive(Clone, Default)]
pub struct StateHooks {
    pub on_running: Vec<StateHook>,
    pub on_completion: Vec<StateHook>,
    pub on_failure: Vec<StateHook>,
    pub on_crashed: Vec<StateHook>,
    pub on_cancellation: Vec<StateHook>,
}

/// How a declared parameter is supplied.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterSpec {
    Required,
    Default(Value),
}

#[derive(Clone)]
pub struct TaskDefinition {
    name: String,
    kind: RunKind,
    source: String,
    body: TaskBody,
    /// Declared parameters; `None` accepts any parameters
    parameters: Option<BTreeMap<String, ParameterSpec>>,
    retries: Option<u32>,
    retry_delay: Option<RetryDelay>,
    jitter_factor: f64,
    retry_condition: Option<RetryCondition>,
    timeout: Option<Duration>,
    cache_policy: CachePolicy,
    cache_expiration: Option<Duration>,
    hooks: StateHooks,
    on_commit: Vec<TxnHook>,
    on_rollback: Vec<TxnHook>,
}

impl TaskDefinition {
    fn with_body(name: impl Into<String>, kind: RunKind, body: TaskBody) -> Self {
        let name = name.into();
        Self {
            source: name.clone(),
            name,
            kind,
            body,
            parameters: None,
            retries: None,
            retry_delay: None,
            jitter_factor: 0.0,
            retry_condition: None,
            timeout: None,
            cache_policy: CachePolicy::none(),
            cache_expiration: None,
            hooks: StateHooks::default(),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        }
    }

    /// Defines a task with a blocking body.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&RunContext, &Parameters) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self::with_body(name, RunKind::Task, TaskBody::Sync(Arc::new(body)))
    }

    /// Defines a task with an async body.
    pub fn new_async<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(RunContext, Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self::with_body(name, RunKind::Task, TaskBody::Async(boxed(body)))
    }

    /// Defines a flow with a blocking body.
    pub fn flow<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&RunContext, &Parameters) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self::with_body(name, RunKind::Flow, TaskBody::Sync(Arc::new(body)))
    }

    /// Defines a flow with an async body.
    pub fn flow_async<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(RunContext, Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self::with_body(name, RunKind::Flow, TaskBody::Async(boxed(body)))
    }

    /// Source text used by the definition-source cache provider.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Declares a required parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.parameters
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), ParameterSpec::Required);
        self
    }

    /// Declares a parameter with a default value.
    pub fn param_default(mut self, name: impl Into<String>, default: Value) -> Self {
        self.parameters
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), ParameterSpec::Default(default));
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: RetryDelay) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_retry_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.max(0.0);
        self
    }

    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&TaskError) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// How long cache records written by this definition stay valid.
    pub fn with_cache_expiration(mut self, expiration: Duration) -> Self {
        self.cache_expiration = Some(expiration);
        self
    }

    pub fn on_running<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RunContext, &State) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        self.hooks.on_running.push(Arc::new(hook));
        self
    }

    pub fn on_completion<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RunContext, &State) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        self.hooks.on_completion.push(Arc::new(hook));
        self
    }

    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RunContext, &State) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        self.hooks.on_failure.push(Arc::new(hook));
        self
    }

    pub fn on_crashed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RunContext, &State) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        self.hooks.on_crashed.push(Arc::new(hook));
        self
    }

    pub fn on_cancellation<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RunContext, &State) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        self.hooks.on_cancellation.push(Arc::new(hook));
        self
    }

    /// Runs when the transaction holding this run's result commits.
    pub fn on_commit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Transaction) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        self.on_commit.push(Arc::new(hook));
        self
    }

    /// Runs when the transaction holding this run's result rolls back.
    pub fn on_rollback<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Transaction) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        self.on_rollback.push(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn body(&self) -> &TaskBody {
        &self.body
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache_policy
    }

    pub fn cache_expiration(&self) -> Option<Duration> {
        self.cache_expiration
    }

    pub fn hooks(&self) -> &StateHooks {
        &self.hooks
    }

    pub fn commit_hooks(&self) -> &[TxnHook] {
        &self.on_commit
    }

    pub fn rollback_hooks(&self) -> &[TxnHook] {
        &self.on_rollback
    }

    /// Stable reference recorded on runs of this definition.
    pub fn definition_ref(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    /// Builds the retry policy, filling unset fields from `defaults`.
    pub fn retry_policy(&self, defaults: &TaskSettings) -> RetryPolicy {
        let delay = self.retry_delay.clone().unwrap_or_else(|| {
            let d = defaults.default_retry_delay();
            if d.is_zero() {
                RetryDelay::None
            } else {
                RetryDelay::Constant(d)
            }
        });
        RetryPolicy {
            retries: self.retries.unwrap_or(defaults.default_retries),
            delay,
            jitter_factor: self.jitter_factor,
            condition: self.retry_condition.clone(),
        }
    }

    /// Effective timeout, falling back to `defaults`.
    pub fn effective_timeout(&self, defaults: &TaskSettings) -> Option<Duration> {
        self.timeout.or_else(|| defaults.default_timeout())
    }

    /// Checks `params` against the declared parameters and fills defaults.
    ///
    /// A missing required parameter or an undeclared one is a validation
    /// failure.
    pub fn bind(&self, params: Parameters) -> Result<Parameters, TaskError> {
        let Some(specs) = &self.parameters else {
            return Ok(params);
        };

        if let Some(unexpected) = params.keys().find(|name| !specs.contains_key(*name)) {
            return Err(TaskError::validation(format!(
                "{} got an unexpected parameter '{}'",
                self.name, unexpected
            )));
        }

        let mut bound = params;
        for (name, spec) in specs {
            if bound.contains_key(name) {
                continue;
            }
            match spec {
                ParameterSpec::Default(value) => {
                    bound.insert(name.clone(), value.clone());
                }
                ParameterSpec::Required => {
                    return Err(TaskError::validation(format!(
                        "{} is missing required parameter '{}'",
                        self.name, name
                    )));
                }
            }
        }
        Ok(bound)
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("async", &self.body.is_async())
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("cache_policy", &self.cache_policy)
            .finish()
    }
}

fn boxed<F, Fut>(body: F) -> AsyncBody
where
    F: Fn(RunContext, Parameters) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(move |ctx, params| body(ctx, params).boxed())
}
