//! Run status command.
//!
//! Displays recent sync runs with their counters and lifecycle state.

use console::style;

use crate::{Result, checkpoint::CheckpointStore, types::RunStatus};

/// Executes the status command to list recent runs.
pub fn execute(limit: usize, json: bool) -> Result<()> {
   let store = CheckpointStore::open_default()?;
   let runs = store.list_runs(limit)?;

   if json {
      println!("{}", serde_json::to_string_pretty(&runs)?);
      return Ok(());
   }

   if runs.is_empty() {
      println!("{}", style("No runs recorded").dim());
      return Ok(());
   }

   println!("{}", style("Recent runs:").bold());
   println!();

   for run in &runs {
      let symbol = match run.status {
         RunStatus::Running => style("●").yellow(),
         RunStatus::Completed if run.failed > 0 => style("●").red(),
         RunStatus::Completed => style("●").green(),
      };
      let state = match run.status {
         RunStatus::Running => "running",
         RunStatus::Completed if run.failed > 0 => "completed with failures",
         RunStatus::Completed => "completed",
      };
      println!(
         "  {} {} {}",
         symbol,
         run.run_id,
         style(format!(
            "({state}, collection: {}, processed: {}, failed: {})",
            run.collection, run.processed, run.failed
         ))
         .dim()
      );
      println!("    {}", style(format!("started {}", run.started_at)).dim());
   }

   Ok(())
}
