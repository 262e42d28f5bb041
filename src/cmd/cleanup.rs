//! Cleanup command.
//!
//! Deletes run records older than the retention window, including their
//! completed and failed line records.

use console::style;

use crate::{Result, checkpoint::CheckpointStore, config};

/// Executes the cleanup command.
pub fn execute(days: Option<u32>, json: bool) -> Result<()> {
   let retain = days.unwrap_or_else(|| config::get().retain_days);
   let mut store = CheckpointStore::open_default()?;
   let removed = store.cleanup(retain)?;

   if json {
      println!("{}", serde_json::json!({ "removed": removed, "retain_days": retain }));
   } else if removed == 0 {
      println!("{}", style(format!("No runs older than {retain} days")).dim());
   } else {
      let plural = if removed == 1 { "" } else { "s" };
      println!("{} Removed {removed} run{plural} older than {retain} days", style("✓").green());
   }

   Ok(())
}
