//! Transaction sequence module wiring.
//!
//! `types` holds the transaction identifiers and the persisted status snapshot,
//! `manager` holds the per-node slot bookkeeping.

mod manager;
mod types;

use std::sync::{Arc, Mutex};

pub use manager::{TransactionSequenceManager, DEFAULT_SLOT_COUNT};
pub use types::{TransactionId, TransactionOrigin, TransactionSequenceStatus, ValidationResult};

/// Sequence manager shared between the coordinator and the member executor of
/// one node.
pub type SharedSequenceManager = Arc<Mutex<TransactionSequenceManager>>;

/// Wrap a manager so it can be shared by the components of one node.
pub fn shared(manager: TransactionSequenceManager) -> SharedSequenceManager {
    Arc::new(Mutex::new(manager))
}

/// Run `f` with exclusive access to the shared manager.
pub fn with_manager<R>(
    sequence: &SharedSequenceManager,
    f: impl FnOnce(&mut TransactionSequenceManager) -> R,
) -> anyhow::Result<R> {
    let mut guard = sequence
        .lock()
        .map_err(|_| anyhow::anyhow!("sequence manager lock poisoned"))?;
    Ok(f(&mut guard))
}
