use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::error;

use super::Transaction;

/// Callback run when a transaction commits or rolls back.
pub type TxnHook =
    Arc<dyn Fn(&Transaction) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync>;

/// Runs a hook, logging its error or panic instead of propagating it.
pub(super) fn run_hook(kind: &str, hook: &TxnHook, txn: &Transaction) {
    match catch_unwind(AssertUnwindSafe(|| hook(txn))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{} hook for transaction {} failed: {}", kind, txn.id(), e),
        Err(_) => error!("{} hook for transaction {} panicked", kind, txn.id()),
    }
}
