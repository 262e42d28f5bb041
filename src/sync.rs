//! Drives a full sync run: read changes, resolve content, index in batches.

use std::time::Instant;

use chrono::Utc;
use futures::{StreamExt, stream};
use indicatif::ProgressBar;
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::config;
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::index::Indexer;
use crate::resolve::ContentResolver;
use crate::retry::{ErrorContext, ErrorHandler, ErrorStats};
use crate::stream::ChangeStream;
use crate::types::{
   Change, ChangeOp, FileChange, IndexDocument, RunRecord, RunStatus, SyncProgress,
};

/// Knobs for one run, frozen before the stream is consumed.
#[derive(Debug, Clone)]
pub struct SyncOptions {
   pub collection:     String,
   pub source:         String,
   pub dry_run:        bool,
   pub batch_size:     usize,
   pub max_retries:    u32,
   pub skip_embedding: bool,
   pub resume:         bool,
   pub workers:        usize,
}

impl SyncOptions {
   pub fn from_config(collection: &str, source: &str) -> Self {
      let cfg = config::get();
      Self {
         collection:     collection.to_string(),
         source:         source.to_string(),
         dry_run:        false,
         batch_size:     cfg.effective_batch_size(),
         max_retries:    cfg.effective_max_retries(),
         skip_embedding: cfg.skip_embedding,
         resume:         true,
         workers:        cfg.effective_workers(),
      }
   }
}

/// What a finished run looks like to the caller.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
   pub run:   RunRecord,
   pub stats: ErrorStats,
}

impl SyncOutcome {
   /// A run succeeds only when nothing is left in a failed state.
   pub fn success(&self) -> bool {
      self.run.failed == 0
   }
}

/// Trait for receiving sync progress updates
pub trait SyncProgressCallback: Send {
   fn progress(&mut self, progress: SyncProgress);
}

impl<F: FnMut(SyncProgress) + Send> SyncProgressCallback for F {
   fn progress(&mut self, progress: SyncProgress) {
      self(progress);
   }
}

impl SyncProgressCallback for () {
   fn progress(&mut self, _progress: SyncProgress) {}
}

impl SyncProgressCallback for ProgressBar {
   fn progress(&mut self, progress: SyncProgress) {
      self.set_position(progress.processed);
      if let Some(current) = &progress.current {
         let short = current.rsplit('/').next().unwrap_or(current);
         self.set_message(short.to_string());
      }
   }
}

/// In-memory counters mirrored to the progress callback.
///
/// The durable truth lives in the run record; these only feed the display,
/// so a resumed run counts skipped lines here without touching the store.
#[derive(Debug, Default)]
struct Tally {
   processed: u64,
   succeeded: u64,
   failed:    u64,
   current:   Option<String>,
}

impl Tally {
   fn snapshot(&self) -> SyncProgress {
      SyncProgress {
         processed: self.processed,
         succeeded: self.succeeded,
         failed:    self.failed,
         current:   self.current.clone(),
      }
   }
}

/// Pipeline driver. Generic over the embedding and indexing backends so
/// tests can swap in in-memory fakes.
pub struct SyncOrchestrator<E, I> {
   checkpoint: CheckpointStore,
   resolver:   ContentResolver,
   handler:    ErrorHandler,
   embedder:   E,
   indexer:    I,
   options:    SyncOptions,
}

impl<E, I> SyncOrchestrator<E, I>
where
   E: Embedder + Send + Sync,
   I: Indexer + Send + Sync,
{
   pub const fn new(
      checkpoint: CheckpointStore,
      resolver: ContentResolver,
      handler: ErrorHandler,
      embedder: E,
      indexer: I,
      options: SyncOptions,
   ) -> Self {
      Self { checkpoint, resolver, handler, embedder, indexer, options }
   }

   pub const fn options(&self) -> &SyncOptions {
      &self.options
   }

   /// Consumes the change stream and returns the completed run.
   ///
   /// Cancellation leaves the run in `running` status so the next invocation
   /// can resume it; the only non-resumable exit is a checkpoint store error.
   pub async fn run<R>(
      &mut self,
      input: R,
      cancel: &CancellationToken,
      callback: &mut dyn SyncProgressCallback,
   ) -> Result<SyncOutcome>
   where
      R: AsyncBufRead + Unpin + Send,
   {
      let started_at = Utc::now().to_rfc3339();
      let (run_id, resumed) = self.open_run()?;
      let mut tally = Tally::default();
      let mut last_changeset: Option<String> = None;

      if resumed {
         self.replay_failed(&run_id, cancel, &mut tally, callback).await?;
      }

      let mut changes = ChangeStream::new(input);
      let mut batch: Vec<FileChange> = Vec::with_capacity(self.options.batch_size);

      loop {
         if cancel.is_cancelled() {
            tracing::warn!(run_id, "sync interrupted; run left resumable");
            return Err(Error::Interrupted { run_id });
         }

         let change = match changes.next_change().await {
            Ok(Some(change)) => change,
            Ok(None) => break,
            Err(Error::Validation { line_no, reason }) => {
               // A line we cannot parse is a recorded failure, not a crash.
               tally.processed += 1;
               if !self.options.dry_run {
                  self.checkpoint.mark_failed(
                     &run_id,
                     line_no,
                     "",
                     ChangeOp::Modify,
                     None,
                     &reason,
                     "",
                  )?;
               }
               tally.failed += 1;
               continue;
            },
            Err(e) => return Err(e),
         };

         let file_change = match change {
            Change::Changeset(meta) => {
               if self.options.dry_run {
                  last_changeset = Some(meta.blob.to_string());
               } else {
                  self.checkpoint.store_changeset(&run_id, &meta.blob)?;
               }
               tracing::debug!(run_id, line_no = meta.line_no, "changeset metadata stored");
               continue;
            },
            Change::File(fc) => fc,
         };

         tally.processed += 1;

         if resumed && self.checkpoint.is_completed(&run_id, file_change.line_no)? {
            tally.succeeded += 1;
            if tally.processed % 100 == 0 {
               callback.progress(tally.snapshot());
            }
            continue;
         }

         batch.push(file_change);
         if batch.len() >= self.options.batch_size {
            let full = std::mem::take(&mut batch);
            self.flush(&run_id, full, &mut tally, callback).await?;
         }
      }

      if !batch.is_empty() {
         self.flush(&run_id, batch, &mut tally, callback).await?;
      }
      callback.progress(tally.snapshot());

      let run = if self.options.dry_run {
         RunRecord {
            run_id,
            collection: self.options.collection.clone(),
            dry_run: true,
            source: self.options.source.clone(),
            status: RunStatus::Completed,
            started_at,
            completed_at: Some(Utc::now().to_rfc3339()),
            processed: tally.processed,
            succeeded: tally.succeeded,
            failed: tally.failed,
            changeset: last_changeset,
         }
      } else {
         self.checkpoint.complete_run(&run_id)?
      };

      tracing::info!(
         run_id = %run.run_id,
         processed = run.processed,
         succeeded = run.succeeded,
         failed = run.failed,
         "sync run complete"
      );
      Ok(SyncOutcome { run, stats: self.handler.stats() })
   }

   /// Picks the run to write under.
   ///
   /// The collection's latest run is resumed while still `running`
   /// (interrupted), and reopened when it completed with failures that
   /// still have retry budget. Anything else gets a fresh run. Dry runs
   /// never touch the store; they get a synthetic id instead.
   fn open_run(&mut self) -> Result<(String, bool)> {
      if self.options.dry_run {
         let run_id = format!("dry_{}_{}", Utc::now().timestamp(), std::process::id());
         return Ok((run_id, false));
      }

      if self.options.resume
         && let Some(last) = self.checkpoint.latest_run(&self.options.collection)?
      {
         if last.status == RunStatus::Running {
            tracing::info!(
               run_id = %last.run_id,
               processed = last.processed,
               failed = last.failed,
               "resuming interrupted run"
            );
            return Ok((last.run_id, true));
         }
         if !self.checkpoint.get_failed(&last.run_id, self.options.max_retries)?.is_empty() {
            tracing::info!(
               run_id = %last.run_id,
               failed = last.failed,
               "reopening completed run to replay failures"
            );
            self.checkpoint.reopen_run(&last.run_id)?;
            return Ok((last.run_id, true));
         }
      }

      let run_id =
         self.checkpoint.start_run(&self.options.collection, false, &self.options.source)?;
      Ok((run_id, false))
   }

   /// Re-runs stored failures that still have retry budget, oldest first.
   async fn replay_failed(
      &mut self,
      run_id: &str,
      cancel: &CancellationToken,
      tally: &mut Tally,
      callback: &mut dyn SyncProgressCallback,
   ) -> Result<()> {
      let pending = self.checkpoint.get_failed(run_id, self.options.max_retries)?;
      if pending.is_empty() {
         return Ok(());
      }
      tracing::info!(run_id, count = pending.len(), "replaying failed lines");

      let mut batch: Vec<FileChange> = Vec::with_capacity(self.options.batch_size);
      for failed in pending {
         if cancel.is_cancelled() {
            return Err(Error::Interrupted { run_id: run_id.to_string() });
         }
         tally.processed += 1;

         match serde_json::from_str::<FileChange>(&failed.payload) {
            Ok(fc) => batch.push(fc),
            Err(e) => {
               self.checkpoint.mark_failed(
                  run_id,
                  failed.line_no,
                  &failed.path,
                  failed.op,
                  failed.repo.as_deref(),
                  &format!("payload unreadable: {e}"),
                  &failed.payload,
               )?;
               tally.failed += 1;
               continue;
            },
         }

         if batch.len() >= self.options.batch_size {
            let full = std::mem::take(&mut batch);
            self.flush(run_id, full, tally, callback).await?;
         }
      }
      if !batch.is_empty() {
         self.flush(run_id, batch, tally, callback).await?;
      }
      Ok(())
   }

   /// Pushes one batch through resolve, embed, and index, attributing the
   /// outcome back to each line.
   ///
   /// Resolution runs concurrently up to the worker limit; submission is one
   /// upsert call plus per-path deletes. When a whole-batch call fails after
   /// retries, every line in it is marked failed so nothing is silently lost.
   async fn flush(
      &mut self,
      run_id: &str,
      batch: Vec<FileChange>,
      tally: &mut Tally,
      callback: &mut dyn SyncProgressCallback,
   ) -> Result<()> {
      if batch.is_empty() {
         return Ok(());
      }
      let flush_started = Instant::now();
      tally.current = batch.last().map(|fc| fc.path.display().to_string());

      let resolver = &self.resolver;
      let resolved: Vec<Result<Option<IndexDocument>>> = stream::iter(batch.iter())
         .map(|fc| resolver.create_change(fc))
         .buffered(self.options.workers.max(1))
         .collect()
         .await;

      let mut doc_lines: Vec<usize> = Vec::new();
      let mut docs: Vec<IndexDocument> = Vec::new();
      let mut delete_lines: Vec<usize> = Vec::new();

      for (i, outcome) in resolved.into_iter().enumerate() {
         match outcome {
            Ok(Some(doc)) if doc.op == ChangeOp::Delete => delete_lines.push(i),
            Ok(Some(doc)) => {
               doc_lines.push(i);
               docs.push(doc);
            },
            Ok(None) => {
               // Skipped content still completes the line, otherwise a
               // resumed run would re-read the same binary forever.
               self.complete_line(run_id, &batch[i], flush_started, tally)?;
            },
            Err(e) => {
               self.fail_line(run_id, &batch[i], &e.to_string(), tally)?;
            },
         }
      }

      if self.options.dry_run {
         // Everything that resolved would have been submitted.
         for &i in doc_lines.iter().chain(&delete_lines) {
            self.complete_line(run_id, &batch[i], flush_started, tally)?;
         }
         callback.progress(tally.snapshot());
         return Ok(());
      }

      if !docs.is_empty() && !self.options.skip_embedding {
         let embedded: Result<Vec<(usize, Vec<f32>)>> = {
            let with_text: Vec<(usize, &str)> = docs
               .iter()
               .enumerate()
               .filter_map(|(pos, doc)| doc.embedding_text().map(|text| (pos, text)))
               .collect();
            if with_text.is_empty() {
               Ok(Vec::new())
            } else {
               let texts: Vec<&str> = with_text.iter().map(|(_, text)| *text).collect();
               let ctx = ErrorContext::new("embed");
               self
                  .handler
                  .execute_with_retry(&ctx, || self.embedder.embed(&texts))
                  .await
                  .map(|vectors| with_text.iter().map(|(pos, _)| *pos).zip(vectors).collect())
            }
         };
         match embedded {
            Ok(placed) => {
               for (pos, vector) in placed {
                  docs[pos].vector = Some(vector);
               }
            },
            Err(e) => {
               // Embedding serves the whole sub-batch; its failure is theirs.
               let reason = e.to_string();
               for &i in &doc_lines {
                  self.fail_line(run_id, &batch[i], &reason, tally)?;
               }
               doc_lines.clear();
               docs.clear();
            },
         }
      }

      if !docs.is_empty() {
         let ctx = ErrorContext::new("index_batch");
         let submitted = self
            .handler
            .execute_with_retry(&ctx, || self.indexer.index_batch(&self.options.collection, &docs))
            .await;
         match submitted {
            Ok(()) => {
               for &i in &doc_lines {
                  self.complete_line(run_id, &batch[i], flush_started, tally)?;
               }
            },
            Err(e) => {
               let reason = e.to_string();
               for &i in &doc_lines {
                  self.fail_line(run_id, &batch[i], &reason, tally)?;
               }
            },
         }
      }

      // Deletes go after upserts so a delete later in the batch wins over
      // an earlier upsert of the same path.
      for &i in &delete_lines {
         let path = batch[i].path.display().to_string();
         let ctx = ErrorContext::new("delete").with_line(&path, batch[i].line_no);
         let removed = self
            .handler
            .execute_with_retry(&ctx, || self.indexer.delete(&self.options.collection, &path))
            .await;
         match removed {
            Ok(()) => self.complete_line(run_id, &batch[i], flush_started, tally)?,
            Err(e) => self.fail_line(run_id, &batch[i], &e.to_string(), tally)?,
         }
      }

      callback.progress(tally.snapshot());
      Ok(())
   }

   fn complete_line(
      &mut self,
      run_id: &str,
      fc: &FileChange,
      flush_started: Instant,
      tally: &mut Tally,
   ) -> Result<()> {
      if !self.options.dry_run {
         self.checkpoint.mark_completed(
            run_id,
            fc.line_no,
            &fc.path.display().to_string(),
            fc.op,
            fc.repo.as_deref(),
            flush_started.elapsed(),
         )?;
      }
      tally.succeeded += 1;
      Ok(())
   }

   fn fail_line(
      &mut self,
      run_id: &str,
      fc: &FileChange,
      error: &str,
      tally: &mut Tally,
   ) -> Result<()> {
      tracing::warn!(line_no = fc.line_no, path = %fc.path.display(), error, "line failed");
      if !self.options.dry_run {
         let payload = serde_json::to_string(fc)?;
         self.checkpoint.mark_failed(
            run_id,
            fc.line_no,
            &fc.path.display().to_string(),
            fc.op,
            fc.repo.as_deref(),
            error,
            &payload,
         )?;
      }
      tally.failed += 1;
      Ok(())
   }
}
