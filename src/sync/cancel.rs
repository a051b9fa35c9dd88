//! Cooperative cancellation for sync runs.
//!
//! A run checks its token between pages and between members. Cancelling
//! never interrupts a store write midway; it stops further work and lets the
//! run report what it has accumulated so far.

pub use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

/// Error out if the run has been cancelled.
pub fn checkpoint(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}
