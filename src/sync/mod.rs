//! Reconciliation of the local member table against a CRM list snapshot.

pub mod cancel;
pub mod reconcile;

pub use cancel::{checkpoint, CancellationToken};
pub use reconcile::{
    merge_profile, reconcile_member, reconcile_members, MemberFailure, MemberOutcome,
    ProfileStore, ReconcileReport, SyncSummary,
};
