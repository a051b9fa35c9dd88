//! Per-member reconciliation against a complete list snapshot.
//!
//! A member present in the snapshot is merged and upserted as active. A
//! member absent from it is deactivated if it exists locally, and left alone
//! otherwise. Merging never replaces a stored value with a blank one.
//!
//! Each member is reconciled independently: a failure is recorded against
//! that member and the run moves on.

use serde::Serialize;

use crate::crm::client::ExternalContactRecord;
use crate::crm::pages::ExternalListSnapshot;
use crate::db::{DbError, LocalProfile, ProfilePatch, SyncRunCounts};
use crate::error::SyncError;
use crate::helpers::{dedupe_ids, email_domain};
use crate::sync::cancel::CancellationToken;
use crate::types::ProfileField;

/// Local profile persistence, keyed by member id.
///
/// A missing profile is a normal `Ok(None)` read, not an error.
pub trait ProfileStore {
    fn get_profile(&self, id: &str) -> Result<Option<LocalProfile>, DbError>;

    /// Insert or replace. Returns true when the profile did not exist before.
    fn upsert_profile(&self, profile: &LocalProfile) -> Result<bool, DbError>;

    /// Update only the parts set in `patch`. Returns false when no profile
    /// has this id.
    fn update_profile_fields(&self, id: &str, patch: &ProfilePatch) -> Result<bool, DbError>;
}

/// What happened to one requested member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOutcome {
    /// Present in the list; profile merged and marked active.
    Updated { created: bool },
    /// Absent from the list; existing profile marked inactive.
    Deactivated,
    /// Absent from the list and unknown locally.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberFailure {
    pub member_id: String,
    pub error: String,
}

/// Counts accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// Members still present in the list (includes `created`).
    pub updated: u32,
    /// Members absent from the list whose profile was marked inactive.
    pub deactivated: u32,
    pub created: u32,
    pub skipped: u32,
    pub failures: Vec<MemberFailure>,
}

impl SyncSummary {
    pub fn record(&mut self, member_id: &str, result: Result<MemberOutcome, SyncError>) {
        match result {
            Ok(MemberOutcome::Updated { created }) => {
                self.updated += 1;
                if created {
                    self.created += 1;
                }
            }
            Ok(MemberOutcome::Deactivated) => self.deactivated += 1,
            Ok(MemberOutcome::Skipped) => self.skipped += 1,
            Err(e) => self.failures.push(MemberFailure {
                member_id: member_id.to_string(),
                error: e.to_string(),
            }),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn counts(&self) -> SyncRunCounts {
        SyncRunCounts {
            updated: self.updated,
            created: self.created,
            deactivated: self.deactivated,
            skipped: self.skipped,
            failed: self.failures.len() as u32,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub summary: SyncSummary,
    /// Number of distinct members looked at before the run ended.
    pub processed: usize,
    pub cancelled: bool,
}

/// Build the merged profile for a member present in the list.
///
/// Per field: the external value if non-blank, else the stored value if
/// non-blank, else empty. `active` is always true. `email_domain` is never
/// reported externally, so a stored value is kept and otherwise derived from
/// the merged email.
pub fn merge_profile(
    member_id: &str,
    external: &ExternalContactRecord,
    existing: Option<&LocalProfile>,
) -> LocalProfile {
    let mut merged = LocalProfile::new(member_id);
    for field in ProfileField::ALL {
        let stored = existing
            .map(|p| p.field(field))
            .filter(|v| !v.trim().is_empty());
        let value = external.field(field).or(stored).unwrap_or_default();
        *merged.field_mut(field) = value.to_string();
    }

    merged.email_domain = existing
        .and_then(|p| p.email_domain.clone())
        .filter(|d| !d.trim().is_empty())
        .or_else(|| email_domain(&merged.email));
    merged.active = true;
    merged
}

/// Reconcile one member against the snapshot.
pub fn reconcile_member<S: ProfileStore + ?Sized>(
    store: &S,
    member_id: &str,
    snapshot: &ExternalListSnapshot,
) -> Result<MemberOutcome, SyncError> {
    if member_id.trim().is_empty() {
        return Err(SyncError::InvalidRequest("blank member id".to_string()));
    }

    let member_error = |source: DbError| SyncError::Member {
        member_id: member_id.to_string(),
        source,
    };

    let existing = store.get_profile(member_id).map_err(member_error)?;

    match snapshot.get(member_id) {
        Some(external) => {
            let merged = merge_profile(member_id, external, existing.as_ref());
            let created = store.upsert_profile(&merged).map_err(member_error)?;
            Ok(MemberOutcome::Updated { created })
        }
        None if existing.is_some() => {
            let existed = store
                .update_profile_fields(member_id, &ProfilePatch::deactivate())
                .map_err(member_error)?;
            if existed {
                Ok(MemberOutcome::Deactivated)
            } else {
                Ok(MemberOutcome::Skipped)
            }
        }
        None => Ok(MemberOutcome::Skipped),
    }
}

/// Reconcile every requested member. Ids are trimmed and de-duplicated first.
///
/// Stops before the next member once `cancel` fires and reports what was
/// accumulated so far.
pub fn reconcile_members<S: ProfileStore + ?Sized>(
    store: &S,
    member_ids: &[String],
    snapshot: &ExternalListSnapshot,
    cancel: &CancellationToken,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for member_id in dedupe_ids(member_ids) {
        if cancel.is_cancelled() {
            report.cancelled = true;
            log::info!(
                "Reconcile cancelled after {} of {} members",
                report.processed,
                member_ids.len()
            );
            break;
        }

        let result = reconcile_member(store, &member_id, snapshot);
        if let Err(e) = &result {
            log::warn!("Member {:?}: reconcile failed: {}", member_id, e);
        }
        report.summary.record(&member_id, result);
        report.processed += 1;
    }

    log::info!(
        "Reconcile list {}: {} updated ({} new), {} deactivated, {} skipped, {} failed",
        snapshot.list_id(),
        report.summary.updated,
        report.summary.created,
        report.summary.deactivated,
        report.summary.skipped,
        report.summary.failures.len()
    );
    report
}
