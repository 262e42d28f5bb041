//! Sync command: drive the pipeline over a change stream from stdin.

use std::time::{Duration, Instant};

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use crate::{
   Error, Result,
   checkpoint::CheckpointStore,
   config,
   embed::HttpEmbedder,
   index::HttpIndexer,
   resolve::ContentResolver,
   retry::{ErrorHandler, ErrorStats},
   sync::{SyncOptions, SyncOrchestrator, SyncOutcome},
   types::RunRecord,
   util::format_duration,
};

/// Flags accepted by the sync command.
#[derive(Debug, Default, Clone)]
pub struct SyncArgs {
   pub collection:     Option<String>,
   pub source:         Option<String>,
   pub dry_run:        bool,
   pub batch_size:     Option<usize>,
   pub max_retries:    Option<u32>,
   pub skip_embedding: bool,
   pub no_resume:      bool,
   pub json:           bool,
}

#[derive(Serialize)]
struct SyncReport<'a> {
   run:   &'a RunRecord,
   stats: &'a ErrorStats,
}

/// Executes the sync command against stdin.
pub async fn execute(args: SyncArgs) -> Result<()> {
   let cfg = config::get();
   config::validate(cfg)?;

   let collection = args.collection.as_deref().unwrap_or(&cfg.collection);
   let source = args.source.as_deref().unwrap_or("stdin");
   let mut options = SyncOptions::from_config(collection, source);
   options.dry_run = args.dry_run;
   options.resume = !args.no_resume;
   if args.skip_embedding {
      options.skip_embedding = true;
   }
   if let Some(batch_size) = args.batch_size {
      options.batch_size = batch_size.clamp(1, config::MAX_BATCH_SIZE_CAP);
   }
   if let Some(max_retries) = args.max_retries {
      options.max_retries = max_retries.min(config::MAX_RETRIES_CAP);
   }

   let checkpoint = CheckpointStore::open_default()?;
   let resolver = ContentResolver::from_config();
   let handler = ErrorHandler::from_config();
   let embedder = HttpEmbedder::from_config()?;
   let indexer = HttpIndexer::from_config()?;
   let mut orchestrator =
      SyncOrchestrator::new(checkpoint, resolver, handler, embedder, indexer, options);

   let cancel = CancellationToken::new();
   let signal = cancel.clone();
   tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
         signal.cancel();
      }
   });

   let started = Instant::now();
   let input = BufReader::new(tokio::io::stdin());

   let outcome = if args.json {
      orchestrator.run(input, &cancel, &mut ()).await?
   } else {
      let bar = ProgressBar::new_spinner();
      bar.set_style(
         ProgressStyle::default_spinner()
            .template("{spinner:.green} {pos} lines {msg}")
            .unwrap(),
      );
      bar.enable_steady_tick(Duration::from_millis(100));
      let mut callback = bar.clone();
      let outcome = orchestrator.run(input, &cancel, &mut callback).await;
      bar.finish_and_clear();
      outcome?
   };

   report(&outcome, started.elapsed(), args.json)?;

   if outcome.run.failed > 0 {
      return Err(Error::Reported {
         message:   format!("{} lines failed", outcome.run.failed),
         exit_code: 2,
      });
   }
   Ok(())
}

fn report(outcome: &SyncOutcome, elapsed: Duration, json: bool) -> Result<()> {
   if json {
      let report = SyncReport { run: &outcome.run, stats: &outcome.stats };
      println!("{}", serde_json::to_string_pretty(&report)?);
      return Ok(());
   }

   let run = &outcome.run;
   let label = if run.dry_run { "Dry run" } else { "Sync" };
   if outcome.success() {
      println!("{} {label} complete in {}", style("✓").green(), format_duration(elapsed));
   } else {
      println!(
         "{} {label} completed with failures in {}",
         style("✗").red(),
         format_duration(elapsed)
      );
   }
   println!("  run: {}", style(&run.run_id).dim());
   let failed = if run.failed > 0 {
      style(run.failed).red()
   } else {
      style(run.failed).dim()
   };
   println!(
      "  processed: {}  succeeded: {}  failed: {}",
      run.processed,
      style(run.succeeded).green(),
      failed
   );

   if outcome.stats.total_failures > 0 {
      println!();
      println!("  {}", style("failures by category:").dim());
      for (category, count) in &outcome.stats.by_category {
         println!("    {category}: {count}");
      }
      let open = outcome.stats.open_circuits();
      if !open.is_empty() {
         println!("  {} {}", style("open circuits:").yellow(), open.join(", "));
      }
   }

   if run.failed > 0 {
      println!("\n  {} gsync failed --run {}", style("inspect:").dim(), run.run_id);
   }
   Ok(())
}
