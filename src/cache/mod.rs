//! Result Caching
//!
//! - [`policy`]: Cache key recipes
//! - [`record`]: Persisted cache records
//! - [`store`]: Record and value persistence

pub mod policy;
pub mod record;
pub mod store;

pub use policy::{CacheKeyContext, CachePolicy, KeyMaterial};
pub use record::CacheRecord;
pub use store::{CacheHit, RecordStore};
