//! Durable checkpoint store for run progress and per-line outcomes.
//!
//! Backed by SQLite in WAL mode with a bounded busy timeout, so multiple
//! processes can point at the same store without one writer blocking another
//! indefinitely. Every logical operation here is exactly one transaction;
//! a crash can lose an uncommitted operation but never half-apply it.

use std::{fs, path::Path, time::Duration};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::{
   Result, config,
   error::Error,
   types::{ChangeOp, FailedLine, RunRecord, RunStatus},
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
   run_id       TEXT PRIMARY KEY,
   collection   TEXT NOT NULL,
   dry_run      INTEGER NOT NULL DEFAULT 0,
   source       TEXT NOT NULL,
   status       TEXT NOT NULL,
   started_at   TEXT NOT NULL,
   completed_at TEXT,
   processed    INTEGER NOT NULL DEFAULT 0,
   succeeded    INTEGER NOT NULL DEFAULT 0,
   failed       INTEGER NOT NULL DEFAULT 0,
   changeset    TEXT
);

CREATE TABLE IF NOT EXISTS completed_lines (
   run_id       TEXT NOT NULL,
   line_no      INTEGER NOT NULL,
   path         TEXT NOT NULL,
   op           TEXT NOT NULL,
   repo         TEXT,
   completed_at TEXT NOT NULL,
   duration_ms  INTEGER NOT NULL DEFAULT 0,
   PRIMARY KEY (run_id, line_no)
);

CREATE TABLE IF NOT EXISTS failed_lines (
   run_id      TEXT NOT NULL,
   line_no     INTEGER NOT NULL,
   path        TEXT NOT NULL,
   op          TEXT NOT NULL,
   repo        TEXT,
   error       TEXT NOT NULL,
   payload     TEXT NOT NULL,
   retry_count INTEGER NOT NULL DEFAULT 0,
   last_try_at TEXT NOT NULL,
   PRIMARY KEY (run_id, line_no)
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status, started_at);
CREATE INDEX IF NOT EXISTS idx_failed_retry ON failed_lines (run_id, retry_count);
";

/// Transactional store of runs and per-line outcomes
pub struct CheckpointStore {
   conn: Connection,
}

impl CheckpointStore {
   /// Opens (or creates) a checkpoint database at the given path.
   pub fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let conn = Connection::open(path)?;
      conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
      conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
      conn.execute_batch(SCHEMA)?;

      Ok(Self { conn })
   }

   /// Opens the store at the configured default location.
   pub fn open_default() -> Result<Self> {
      Self::open(config::checkpoint_db_path(), config::get().busy_timeout_ms)
   }

   /// Allocates a new run in `running` status and returns its identifier.
   ///
   /// Run ids follow `sync_<timestamp>_<pid>`, unique across processes
   /// without coordination. A same-second restart of one process bumps the
   /// timestamp until the id is free.
   pub fn start_run(&mut self, collection: &str, dry_run: bool, source: &str) -> Result<String> {
      let pid = std::process::id();
      let started_at = Utc::now().to_rfc3339();
      let mut ts = Utc::now().timestamp();

      // Take the write lock before probing, so the id check and the insert
      // see one consistent state and busy_timeout covers the whole step.
      let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
      let run_id = loop {
         let candidate = format!("sync_{ts}_{pid}");
         let exists = tx
            .query_row("SELECT 1 FROM runs WHERE run_id = ?1", params![candidate], |_| Ok(()))
            .optional()?
            .is_some();
         if !exists {
            break candidate;
         }
         ts += 1;
      };

      tx.execute(
         "INSERT INTO runs (run_id, collection, dry_run, source, status, started_at)
          VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
         params![run_id, collection, dry_run, source, RunStatus::Running.as_str(), started_at],
      )?;
      tx.commit()?;

      tracing::info!(run_id, collection, dry_run, "started run");
      Ok(run_id)
   }

   /// Returns the most recently started run still in `running` status.
   pub fn get_active_run(&self) -> Result<Option<RunRecord>> {
      let record = self
         .conn
         .query_row(
            &format!(
               "SELECT {RUN_COLUMNS} FROM runs WHERE status = ?1
                ORDER BY started_at DESC, run_id DESC LIMIT 1"
            ),
            params![RunStatus::Running.as_str()],
            run_from_row,
         )
         .optional()?;
      Ok(record)
   }

   /// Returns the most recently started run for a collection, any status.
   pub fn latest_run(&self, collection: &str) -> Result<Option<RunRecord>> {
      let record = self
         .conn
         .query_row(
            &format!(
               "SELECT {RUN_COLUMNS} FROM runs WHERE collection = ?1
                ORDER BY started_at DESC, run_id DESC LIMIT 1"
            ),
            params![collection],
            run_from_row,
         )
         .optional()?;
      Ok(record)
   }

   /// Whether this line already completed within the run.
   pub fn is_completed(&self, run_id: &str, line_no: u64) -> Result<bool> {
      let found = self
         .conn
         .query_row(
            "SELECT 1 FROM completed_lines WHERE run_id = ?1 AND line_no = ?2",
            params![run_id, line_no],
            |_| Ok(()),
         )
         .optional()?;
      Ok(found.is_some())
   }

   /// Records a successful line in one transaction.
   ///
   /// Removes any failed-record for the line, upserts the completed-record,
   /// and adjusts the run counters. The `failed` counter always mirrors the
   /// number of remaining failed-records, so a line completing on replay
   /// takes the run one step back toward a clean outcome.
   pub fn mark_completed(
      &mut self,
      run_id: &str,
      line_no: u64,
      path: &str,
      op: ChangeOp,
      repo: Option<&str>,
      duration: Duration,
   ) -> Result<()> {
      let now = Utc::now().to_rfc3339();
      let tx = self.conn.transaction()?;

      let removed_failed = tx.execute(
         "DELETE FROM failed_lines WHERE run_id = ?1 AND line_no = ?2",
         params![run_id, line_no],
      )?;
      let inserted = tx.execute(
         "INSERT OR REPLACE INTO completed_lines
             (run_id, line_no, path, op, repo, completed_at, duration_ms)
          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
         params![run_id, line_no, path, op.as_str(), repo, now, duration.as_millis() as u64],
      )?;
      tx.execute(
         "UPDATE runs SET processed = processed + 1,
                          succeeded = succeeded + ?2,
                          failed = failed - ?3
          WHERE run_id = ?1",
         params![run_id, inserted as u64, removed_failed as u64],
      )?;
      tx.commit()?;

      tracing::debug!(run_id, line_no, path, "line completed");
      Ok(())
   }

   /// Records a failed line in one transaction.
   ///
   /// First failure inserts the record with retry_count 0; later failures
   /// update the error and bump retry_count. The stored payload is enough to
   /// replay the line without re-reading the input stream.
   pub fn mark_failed(
      &mut self,
      run_id: &str,
      line_no: u64,
      path: &str,
      op: ChangeOp,
      repo: Option<&str>,
      error: &str,
      payload: &str,
   ) -> Result<()> {
      let now = Utc::now().to_rfc3339();
      let tx = self.conn.transaction()?;

      let updated = tx.execute(
         "UPDATE failed_lines
             SET error = ?3, payload = ?4, retry_count = retry_count + 1, last_try_at = ?5
          WHERE run_id = ?1 AND line_no = ?2",
         params![run_id, line_no, error, payload, now],
      )?;
      if updated == 0 {
         tx.execute(
            "INSERT INTO failed_lines
                (run_id, line_no, path, op, repo, error, payload, retry_count, last_try_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
            params![run_id, line_no, path, op.as_str(), repo, error, payload, now],
         )?;
      }
      tx.execute(
         "UPDATE runs SET processed = processed + 1, failed = failed + ?2 WHERE run_id = ?1",
         params![run_id, u64::from(updated == 0)],
      )?;
      tx.commit()?;

      tracing::debug!(run_id, line_no, path, error, "line failed");
      Ok(())
   }

   /// Failed lines still below the retry ceiling, in line order.
   pub fn get_failed(&self, run_id: &str, max_retries: u32) -> Result<Vec<FailedLine>> {
      let mut stmt = self.conn.prepare(&format!(
         "SELECT {FAILED_COLUMNS} FROM failed_lines
          WHERE run_id = ?1 AND retry_count < ?2 ORDER BY line_no"
      ))?;
      let rows = stmt.query_map(params![run_id, max_retries], failed_from_row)?;
      Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
   }

   /// All failed lines for a run, regardless of retry count. Read-only view.
   pub fn get_failed_all(&self, run_id: &str) -> Result<Vec<FailedLine>> {
      let mut stmt = self.conn.prepare(&format!(
         "SELECT {FAILED_COLUMNS} FROM failed_lines WHERE run_id = ?1 ORDER BY line_no"
      ))?;
      let rows = stmt.query_map(params![run_id], failed_from_row)?;
      Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
   }

   /// Marks the run completed and returns its final counters.
   pub fn complete_run(&mut self, run_id: &str) -> Result<RunRecord> {
      let now = Utc::now().to_rfc3339();
      let tx = self.conn.transaction()?;
      let updated = tx.execute(
         "UPDATE runs SET status = ?2, completed_at = ?3 WHERE run_id = ?1",
         params![run_id, RunStatus::Completed.as_str(), now],
      )?;
      if updated == 0 {
         return Err(Error::RunNotFound(run_id.to_string()));
      }
      let record = tx.query_row(
         &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
         params![run_id],
         run_from_row,
      )?;
      tx.commit()?;

      tracing::info!(
         run_id,
         processed = record.processed,
         succeeded = record.succeeded,
         failed = record.failed,
         "run completed"
      );
      Ok(record)
   }

   /// Puts a completed run back into `running` status so its remaining
   /// failed lines can be replayed and the run re-completed.
   pub fn reopen_run(&mut self, run_id: &str) -> Result<()> {
      let updated = self.conn.execute(
         "UPDATE runs SET status = ?2, completed_at = NULL WHERE run_id = ?1",
         params![run_id, RunStatus::Running.as_str()],
      )?;
      if updated == 0 {
         return Err(Error::RunNotFound(run_id.to_string()));
      }
      tracing::info!(run_id, "reopened run for replay");
      Ok(())
   }

   /// Deletes runs older than the retention window, with their line records.
   /// Returns the number of runs removed.
   pub fn cleanup(&mut self, retain_days: u32) -> Result<usize> {
      let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retain_days))).to_rfc3339();
      let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

      let old_runs: Vec<String> = {
         let mut stmt = tx.prepare("SELECT run_id FROM runs WHERE started_at < ?1")?;
         let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
         rows.collect::<rusqlite::Result<Vec<_>>>()?
      };

      for run_id in &old_runs {
         tx.execute("DELETE FROM completed_lines WHERE run_id = ?1", params![run_id])?;
         tx.execute("DELETE FROM failed_lines WHERE run_id = ?1", params![run_id])?;
         tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
      }
      tx.commit()?;

      Ok(old_runs.len())
   }

   /// Attaches opaque upstream changeset metadata to a run.
   pub fn store_changeset(&mut self, run_id: &str, blob: &serde_json::Value) -> Result<()> {
      let updated = self.conn.execute(
         "UPDATE runs SET changeset = ?2 WHERE run_id = ?1",
         params![run_id, blob.to_string()],
      )?;
      if updated == 0 {
         return Err(Error::RunNotFound(run_id.to_string()));
      }
      Ok(())
   }

   /// Most recent runs, newest first. Read-only view.
   pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
      let mut stmt = self.conn.prepare(&format!(
         "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, run_id DESC LIMIT ?1"
      ))?;
      let rows = stmt.query_map(params![limit as u64], run_from_row)?;
      Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
   }

   /// Looks up one run by id. Read-only view.
   pub fn get_run(&self, run_id: &str) -> Result<RunRecord> {
      self
         .conn
         .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
            params![run_id],
            run_from_row,
         )
         .optional()?
         .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
   }
}

const RUN_COLUMNS: &str = "run_id, collection, dry_run, source, status, started_at, \
                           completed_at, processed, succeeded, failed, changeset";

const FAILED_COLUMNS: &str =
   "run_id, line_no, path, op, repo, error, payload, retry_count, last_try_at";

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
   let status_str: String = row.get(4)?;
   let status = RunStatus::parse(&status_str).ok_or_else(|| {
      rusqlite::Error::FromSqlConversionFailure(
         4,
         rusqlite::types::Type::Text,
         format!("unknown run status: {status_str}").into(),
      )
   })?;
   Ok(RunRecord {
      run_id: row.get(0)?,
      collection: row.get(1)?,
      dry_run: row.get(2)?,
      source: row.get(3)?,
      status,
      started_at: row.get(5)?,
      completed_at: row.get(6)?,
      processed: row.get(7)?,
      succeeded: row.get(8)?,
      failed: row.get(9)?,
      changeset: row.get(10)?,
   })
}

fn failed_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailedLine> {
   let op_str: String = row.get(3)?;
   let op = ChangeOp::parse(&op_str).ok_or_else(|| {
      rusqlite::Error::FromSqlConversionFailure(
         3,
         rusqlite::types::Type::Text,
         format!("unknown op: {op_str}").into(),
      )
   })?;
   Ok(FailedLine {
      run_id: row.get(0)?,
      line_no: row.get(1)?,
      path: row.get(2)?,
      op,
      repo: row.get(4)?,
      error: row.get(5)?,
      payload: row.get(6)?,
      retry_count: row.get(7)?,
      last_try_at: row.get(8)?,
   })
}
