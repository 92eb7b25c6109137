//! [`ContextStore`](voyage_core::traits::ContextStore) implementations.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use voyage_core::error::{Result, VoyageError};
use voyage_core::types::RunId;

/// Optimistic concurrency check shared by the stores.
///
/// An incoming snapshot at revision `r` may only replace a stored one at
/// revision `r - 1`; a missing row counts as revision 0.
pub(crate) fn check_revision(run_id: &RunId, stored: Option<u64>, incoming: u64) -> Result<()> {
    let expected = incoming.saturating_sub(1);
    let found = stored.unwrap_or(0);
    if incoming == 0 || found != expected {
        return Err(VoyageError::PersistenceConflict {
            run_id: run_id.clone(),
            expected,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write() {
        let id = RunId::new();
        assert!(check_revision(&id, None, 1).is_ok());
        assert!(check_revision(&id, None, 2).is_err());
    }

    #[test]
    fn test_sequential_writes() {
        let id = RunId::new();
        assert!(check_revision(&id, Some(3), 4).is_ok());
        assert!(check_revision(&id, Some(4), 4).is_err());
    }

    #[test]
    fn test_uncommitted_snapshot_rejected() {
        let id = RunId::new();
        assert!(matches!(
            check_revision(&id, None, 0),
            Err(VoyageError::PersistenceConflict { .. })
        ));
    }
}
