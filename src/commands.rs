//! Operations exposed to the admin-facing surface.
//!
//! Each operation validates configuration before building a CRM client, so a
//! missing credential fails before any network call. The HTTP layer in
//! `server` is a thin wrapper over these.

use std::sync::Arc;

use serde::Serialize;

use crate::crm::client::{CompanyRecord, CrmClient};
use crate::crm::companies::{associated_companies, fetch_companies, CompanySource};
use crate::crm::mapping::{resolve_field_mapping, FieldMapping, ListMetadataSource};
use crate::crm::pages::{fetch_snapshot, ContactPageSource, SnapshotOutcome};
use crate::db::{DbFieldMapping, DbSyncRun, SyncRunCounts, SyncRunStatus};
use crate::error::SyncError;
use crate::state::{create_or_update_config, AppState};
use crate::sync::cancel::{checkpoint, CancellationToken};
use crate::sync::reconcile::{reconcile_members, ReconcileReport, SyncSummary};

// =============================================================================
// Member sync
// =============================================================================

/// Result of one sync run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunReport {
    pub run_id: String,
    pub list_id: u64,
    pub status: SyncRunStatus,
    pub cancelled: bool,
    pub summary: SyncSummary,
}

impl SyncRunReport {
    /// Every requested member was reconciled without error.
    pub fn success(&self) -> bool {
        self.status == SyncRunStatus::Completed
    }
}

/// Mirror the configured CRM list onto the requested members.
pub async fn run_member_sync(
    state: &Arc<AppState>,
    member_ids: Vec<String>,
    cancel: CancellationToken,
) -> Result<SyncRunReport, SyncError> {
    let crm = state.config().crm;
    crm.require_api_key()?;
    let list_id = crm.require_list_id()?;
    let client = CrmClient::new(&crm)?;

    run_member_sync_with(state, &client, list_id, crm.page_size, member_ids, cancel).await
}

/// Sync run against an arbitrary page source.
///
/// Holds the single-flight slot for the whole run and records the run in
/// `sync_runs`. The list is walked to completion before any member is
/// touched; a walk that fails or is cancelled changes nothing.
pub async fn run_member_sync_with<S: ContactPageSource + ?Sized>(
    state: &Arc<AppState>,
    source: &S,
    list_id: u64,
    page_size: u32,
    member_ids: Vec<String>,
    cancel: CancellationToken,
) -> Result<SyncRunReport, SyncError> {
    let run = state.begin_run(&cancel)?;
    let run_id = run.run_id().to_string();
    let requested = member_ids.len() as u32;

    let recorded_id = run_id.clone();
    state
        .with_db_blocking(move |db| Ok(db.insert_sync_run(&recorded_id, list_id, requested)?))
        .await?;
    log::info!(
        "Sync run {}: {} member(s) against list {}",
        run_id,
        requested,
        list_id
    );

    let outcome = reconcile_run(state, source, list_id, page_size, &member_ids, &cancel).await;

    let (status, counts, error) = match &outcome {
        Ok(report) if report.cancelled => (SyncRunStatus::Cancelled, report.summary.counts(), None),
        Ok(report) if report.summary.has_failures() => (
            SyncRunStatus::CompletedWithFailures,
            report.summary.counts(),
            None,
        ),
        Ok(report) => (SyncRunStatus::Completed, report.summary.counts(), None),
        Err(e) => (SyncRunStatus::Failed, SyncRunCounts::default(), Some(e.to_string())),
    };
    let recorded_id = run_id.clone();
    if let Err(e) = state
        .with_db_blocking(move |db| {
            Ok(db.finish_sync_run(&recorded_id, status, &counts, error.as_deref())?)
        })
        .await
    {
        log::warn!("Sync run {}: failed to record completion: {}", run_id, e);
    }
    drop(run);

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            log::warn!("Sync run {} failed: {}", run_id, e);
            return Err(e);
        }
    };

    log::info!(
        "Sync run {} {}: {} updated, {} deactivated, {} failed",
        run_id,
        status.as_str(),
        report.summary.updated,
        report.summary.deactivated,
        report.summary.failures.len()
    );

    Ok(SyncRunReport {
        run_id,
        list_id,
        status,
        cancelled: report.cancelled,
        summary: report.summary,
    })
}

async fn reconcile_run<S: ContactPageSource + ?Sized>(
    state: &Arc<AppState>,
    source: &S,
    list_id: u64,
    page_size: u32,
    member_ids: &[String],
    cancel: &CancellationToken,
) -> Result<ReconcileReport, SyncError> {
    let snapshot = match fetch_snapshot(source, list_id, page_size, cancel).await? {
        SnapshotOutcome::Complete(snapshot) => snapshot,
        SnapshotOutcome::Cancelled { .. } => {
            return Ok(ReconcileReport {
                cancelled: true,
                ..ReconcileReport::default()
            })
        }
    };

    let member_ids = member_ids.to_vec();
    let cancel = cancel.clone();
    state
        .with_db_blocking(move |db| Ok(reconcile_members(db, &member_ids, &snapshot, &cancel)))
        .await
}

/// Cancel the in-flight run, if any. Returns its id.
pub fn cancel_member_sync(state: &AppState) -> Option<String> {
    let cancelled = state.cancel_active_run();
    if let Some(run_id) = &cancelled {
        log::info!("Sync run {}: cancel requested", run_id);
    }
    cancelled
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningSync {
    pub run_id: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub api_key_set: bool,
    pub list_id: Option<u64>,
    pub member_count: i64,
    pub active_member_count: i64,
    pub running: Option<RunningSync>,
    pub last_run: Option<DbSyncRun>,
}

pub async fn get_sync_status(state: &Arc<AppState>) -> Result<SyncStatus, SyncError> {
    let crm = state.config().crm;
    let ((member_count, active_member_count), last_run) = state
        .with_db_blocking(|db| {
            let counts = db.count_members()?;
            let last = db.recent_sync_runs(1)?.into_iter().next();
            Ok((counts, last))
        })
        .await?;

    Ok(SyncStatus {
        api_key_set: crm.require_api_key().is_ok(),
        list_id: crm.list_id,
        member_count,
        active_member_count,
        running: state.active_run().map(|run| RunningSync {
            run_id: run.run_id,
            started_at: run.started_at,
        }),
        last_run,
    })
}

// =============================================================================
// Connection test and field mapping
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub success: bool,
    pub list_id: u64,
    pub list_name: String,
    pub properties: FieldMapping,
}

/// Fetch the list's filters, infer the field mapping, and store it.
///
/// Falls back to the configured list when `list_id` is not given. When no
/// list is configured yet, a successful test adopts the tested list.
pub async fn test_crm_connection(
    state: &Arc<AppState>,
    list_id: Option<u64>,
) -> Result<ConnectionTestResult, SyncError> {
    let crm = state.config().crm;
    crm.require_api_key()?;
    let list_id = match list_id {
        Some(id) => id,
        None => crm.require_list_id()?,
    };
    let client = CrmClient::new(&crm)?;

    test_crm_connection_with(state, &client, list_id).await
}

pub async fn test_crm_connection_with<S: ListMetadataSource + ?Sized>(
    state: &Arc<AppState>,
    source: &S,
    list_id: u64,
) -> Result<ConnectionTestResult, SyncError> {
    let discovered = resolve_field_mapping(source, list_id).await?;

    // Storing the mapping is for display later; the test itself succeeded.
    let (list_name, properties) = (discovered.list_name.clone(), discovered.properties.clone());
    if let Err(e) = state
        .with_db_blocking(move |db| Ok(db.save_field_mapping(list_id, &list_name, &properties)?))
        .await
    {
        log::warn!("List {}: failed to store field mapping: {}", list_id, e);
    }

    if state.config().crm.list_id.is_none() {
        match create_or_update_config(state, |c| {
            c.crm.list_id.get_or_insert(list_id);
        }) {
            Ok(_) => log::info!("List {}: adopted as the configured list", list_id),
            Err(e) => log::warn!("List {}: failed to save as configured list: {}", list_id, e),
        }
    }

    Ok(ConnectionTestResult {
        success: true,
        list_id: discovered.list_id,
        list_name: discovered.list_name,
        properties: discovered.properties,
    })
}

/// The mapping stored by the last connection test for this list.
pub async fn get_field_mapping(
    state: &Arc<AppState>,
    list_id: Option<u64>,
) -> Result<Option<DbFieldMapping>, SyncError> {
    let list_id = match list_id {
        Some(id) => id,
        None => state.config().crm.require_list_id()?,
    };
    state
        .with_db_blocking(move |db| Ok(db.get_field_mapping(list_id)?))
        .await
}

// =============================================================================
// Company enrichment
// =============================================================================

/// Companies associated with members of the configured list.
pub async fn list_member_companies(
    state: &AppState,
    cancel: &CancellationToken,
) -> Result<Vec<CompanyRecord>, SyncError> {
    let crm = state.config().crm;
    crm.require_api_key()?;
    let list_id = crm.require_list_id()?;
    let client = Arc::new(CrmClient::new(&crm)?);

    list_member_companies_with(client, list_id, crm.page_size, crm.company_concurrency, cancel)
        .await
}

pub async fn list_member_companies_with<S: ContactPageSource + CompanySource>(
    source: Arc<S>,
    list_id: u64,
    page_size: u32,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<CompanyRecord>, SyncError> {
    let snapshot = match fetch_snapshot(source.as_ref(), list_id, page_size, cancel).await? {
        SnapshotOutcome::Complete(snapshot) => snapshot,
        SnapshotOutcome::Cancelled { .. } => return Err(SyncError::Cancelled),
    };

    let companies = associated_companies(&snapshot);
    log::info!(
        "List {}: {} distinct companies across {} contacts",
        list_id,
        companies.len(),
        snapshot.len()
    );

    let records = fetch_companies(source, companies, concurrency, cancel).await;
    checkpoint(cancel)?;
    Ok(records)
}
