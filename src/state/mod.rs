//! Run State Model
//!
//! The vocabulary of run states and the rules for moving between them.
//!
//! # Structure
//!
//! - [`types`]: State values and state types
//! - [`transition`]: The legal transition table
//! - [`history`]: Accepted-transition log

pub mod history;
pub mod transition;
pub mod types;

pub use history::{RunHistory, TransitionEvent};
pub use transition::{is_legal, validate, TransitionError};
pub use types::{Outcome, State, StateData, StateType, CACHED, TIMED_OUT};
