use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::*;

impl MemberDb {
    // =========================================================================
    // Sync run history
    // =========================================================================

    /// Record the start of a run.
    pub fn insert_sync_run(&self, run_id: &str, list_id: u64, requested: u32) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO sync_runs (id, list_id, started_at, status, requested)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                list_id as i64,
                Utc::now().to_rfc3339(),
                SyncRunStatus::Running.as_str(),
                requested,
            ],
        )?;
        Ok(())
    }

    /// Close a run with its final status and counters.
    pub fn finish_sync_run(
        &self,
        run_id: &str,
        status: SyncRunStatus,
        counts: &SyncRunCounts,
        error: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE sync_runs
             SET finished_at = ?2, status = ?3, updated = ?4, created = ?5,
                 deactivated = ?6, skipped = ?7, failed = ?8, error = ?9
             WHERE id = ?1",
            params![
                run_id,
                Utc::now().to_rfc3339(),
                status.as_str(),
                counts.updated,
                counts.created,
                counts.deactivated,
                counts.skipped,
                counts.failed,
                error,
            ],
        )?;
        Ok(())
    }

    pub fn get_sync_run(&self, run_id: &str) -> Result<Option<DbSyncRun>, DbError> {
        let run = self
            .conn
            .query_row(
                "SELECT id, list_id, started_at, finished_at, status, requested,
                        updated, created, deactivated, skipped, failed, error
                 FROM sync_runs WHERE id = ?1",
                params![run_id],
                Self::map_sync_run_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs first.
    pub fn recent_sync_runs(&self, limit: usize) -> Result<Vec<DbSyncRun>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, list_id, started_at, finished_at, status, requested,
                    updated, created, deactivated, skipped, failed, error
             FROM sync_runs
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::map_sync_run_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    /// Mark runs left `running` by a previous process as failed.
    pub fn fail_interrupted_sync_runs(&self) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            "UPDATE sync_runs
             SET status = ?1, finished_at = ?2, error = 'interrupted before completion'
             WHERE status = ?3",
            params![
                SyncRunStatus::Failed.as_str(),
                Utc::now().to_rfc3339(),
                SyncRunStatus::Running.as_str(),
            ],
        )?;
        Ok(changed)
    }

    fn map_sync_run_row(row: &rusqlite::Row) -> rusqlite::Result<DbSyncRun> {
        let status: String = row.get(4)?;
        Ok(DbSyncRun {
            id: row.get(0)?,
            list_id: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            status: SyncRunStatus::parse(&status).unwrap_or(SyncRunStatus::Failed),
            requested: row.get(5)?,
            counts: SyncRunCounts {
                updated: row.get(6)?,
                created: row.get(7)?,
                deactivated: row.get(8)?,
                skipped: row.get(9)?,
                failed: row.get(10)?,
            },
            error: row.get(11)?,
        })
    }
}
