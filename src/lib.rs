//! FlowRunner - Run Engine for Tasks and Flows
//!
//! Executes user-defined tasks and flows as tracked runs. Every run moves
//! through an explicit state lifecycle that is proposed to, and accepted
//! by, an orchestration API. Around each run the engine applies retries,
//! timeouts, result caching and transactional cache writes.
//!
//! # Architecture
//!
//! - [`state`]: run states, transition rules and transition history
//! - [`engine`]: definitions, the lifecycle machine and its two drivers
//! - [`cache`]: cache policies, key computation and the record store
//! - [`transaction`]: nested transactions over cache writes
//! - [`future`]: run futures and input resolution
//! - [`executor`]: task runners for threads, tokio and inline execution
//! - [`orchestration`]: the orchestration client and an in-memory orchestrator
//! - [`storage`] and [`locking`]: pluggable result storage and lock managers
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrunner::cache::CachePolicy;
//! use flowrunner::engine::{Engine, RunRequest, TaskDefinition};
//! use serde_json::json;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     flowrunner::logging::setup_logging(false);
//!
//!     let engine = Engine::in_memory();
//!     let fetch = TaskDefinition::new("fetch", |_ctx, params| {
//!         Ok(json!(format!("data for {}", params["id"])))
//!     })
//!     .param("id")
//!     .with_retries(3)
//!     .with_cache_policy(CachePolicy::inputs());
//!
//!     // The second run is answered from the cache
//!     for _ in 0..2 {
//!         let value = engine.execute(RunRequest::new(fetch.clone()).with_param("id", json!(7)))?;
//!         println!("{}", value);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod future;
pub mod locking;
pub mod logging;
pub mod orchestration;
pub mod retry;
pub mod run;
pub mod state;
pub mod storage;
pub mod transaction;

// Re-export commonly used types
pub use cache::CachePolicy;
pub use config::Settings;
pub use engine::{AsyncEngine, Engine, RunContext, RunRequest, SyncEngine, TaskDefinition};
pub use error::{FailureKind, RunError, TaskError};
pub use executor::{ImmediateTaskRunner, MapArg, TaskRunner, ThreadPoolTaskRunner, TokioTaskRunner};
pub use future::{Input, Inputs, RunFuture};
pub use retry::RetryDelay;
pub use run::{Parameters, RunKind};
pub use state::{State, StateType};
pub use transaction::{IsolationLevel, Transaction, TxnOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
