#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use gsync::{
   checkpoint::CheckpointStore,
   embed::dummy::DummyEmbedder,
   index::MemoryIndexer,
   resolve::ContentResolver,
   retry::{ErrorHandler, Sleeper},
   sync::{SyncOptions, SyncOrchestrator},
};
use tempfile::TempDir;
use tokio::io::BufReader;

pub const EMBED_DIM: usize = 8;

/// Skips retry backoff so tests never wait in real time.
pub struct NoopSleeper;

#[async_trait::async_trait]
impl Sleeper for NoopSleeper {
   async fn sleep(&self, _delay: Duration) {}
}

pub fn options(collection: &str) -> SyncOptions {
   SyncOptions {
      collection:     collection.to_string(),
      source:         "stdin".to_string(),
      dry_run:        false,
      batch_size:     2,
      max_retries:    3,
      skip_embedding: false,
      resume:         true,
      workers:        2,
   }
}

pub fn open_store(dir: &TempDir) -> CheckpointStore {
   CheckpointStore::open(&dir.path().join("checkpoints.db"), 5_000).expect("open checkpoint store")
}

/// Orchestrator wired to a shared in-memory backend; the caller keeps its
/// own handle to the indexer for assertions after the run.
pub fn orchestrator(
   dir: &TempDir,
   indexer: Arc<MemoryIndexer>,
   options: SyncOptions,
) -> SyncOrchestrator<DummyEmbedder, Arc<MemoryIndexer>> {
   let handler =
      ErrorHandler::new(5, Duration::from_millis(50)).with_sleeper(Box::new(NoopSleeper));
   SyncOrchestrator::new(
      open_store(dir),
      ContentResolver::new(1_048_576, 65_536, 512_000),
      handler,
      DummyEmbedder::new(EMBED_DIM),
      indexer,
      options,
   )
}

pub fn reader(lines: &str) -> BufReader<&[u8]> {
   BufReader::new(lines.as_bytes())
}
