//! System health check command.
//!
//! Verifies that the checkpoint store, indexing backend, and embedding
//! service are reachable and properly configured.

use std::path::Path;

use console::style;

use crate::{
   Result, config,
   checkpoint::CheckpointStore,
   embed::{Embedder, HttpEmbedder},
   index::{HttpIndexer, Indexer},
   util::{format_size, get_dir_size},
};

/// Executes the doctor command to check system health.
pub async fn execute() -> Result<()> {
   println!("{}\n", style("gsync Doctor").bold());

   let cfg = config::get();
   let root = config::base_dir();
   let data = config::data_dir();

   check_dir("Root", root);
   check_dir("Data", data);

   println!();

   let mut all_good = true;

   // Checkpoint store: opening runs the schema, a read proves it is usable.
   match CheckpointStore::open_default().and_then(|store| store.list_runs(1)) {
      Ok(runs) => {
         let note = runs
            .first()
            .map_or_else(|| "no runs yet".to_string(), |run| format!("last run {}", run.run_id));
         println!("{} Checkpoint store: {}", style("✓").green(), style(note).dim());
      },
      Err(e) => {
         all_good = false;
         println!("{} Checkpoint store: {}", style("✗").red(), style(e).dim());
      },
   }

   match HttpIndexer::from_config() {
      Ok(indexer) => {
         match indexer.health().await {
            Ok(()) => {
               println!("{} Backend: {}", style("✓").green(), style(&cfg.backend_url).dim());
            },
            Err(e) => {
               all_good = false;
               println!("{} Backend: {}", style("✗").red(), style(e).dim());
            },
         }
         match indexer.collection_exists(&cfg.collection).await {
            Ok(true) => {
               println!("{} Collection: {}", style("✓").green(), style(&cfg.collection).dim());
            },
            Ok(false) => println!(
               "{} Collection: {} {}",
               style("○").yellow(),
               style(&cfg.collection).dim(),
               style("(created on first sync)").dim()
            ),
            Err(e) => {
               all_good = false;
               println!("{} Collection: {}", style("✗").red(), style(e).dim());
            },
         }
      },
      Err(e) => {
         all_good = false;
         println!("{} Backend: {}", style("✗").red(), style(e).dim());
      },
   }

   if cfg.skip_embedding {
      println!("{} Embedder: {}", style("○").yellow(), style("skipped by config").dim());
   } else {
      // One tiny request proves the model is loaded and shows its width.
      match embed_probe().await {
         Ok(dim) => println!(
            "{} Embedder: {} {}",
            style("✓").green(),
            style(&cfg.embed_model).dim(),
            style(format!("({dim} dims)")).dim()
         ),
         Err(e) => {
            all_good = false;
            println!("{} Embedder: {}", style("✗").red(), style(e).dim());
         },
      }
   }

   if data.exists()
      && let Ok(size) = get_dir_size(data)
   {
      println!("\n{} {}", style("Data directory size:").dim(), style(format_size(size)).cyan());
   }

   if all_good {
      println!("\n{}", style("✓ All checks passed. Ready to sync.").green().bold());
   } else {
      println!(
         "\n{}",
         style("✗ Some checks failed. Fix the items above before syncing.")
            .red()
            .bold()
      );
   }

   Ok(())
}

async fn embed_probe() -> Result<usize> {
   let embedder = HttpEmbedder::from_config()?;
   let vectors = embedder.embed(&["doctor probe"]).await?;
   Ok(vectors.first().map_or(0, Vec::len))
}

/// Checks if a directory exists and prints its status.
fn check_dir(name: &str, path: &Path) {
   let exists = path.exists();
   let symbol = if exists {
      style("✓").green()
   } else {
      style("✗").red()
   };
   println!("{} {}: {}", symbol, name, style(path.display()).dim());
}
