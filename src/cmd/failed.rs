//! Failed-lines command.
//!
//! Lists the lines of a run that have not completed, with their last error
//! and retry count.

use console::style;

use crate::{Result, checkpoint::CheckpointStore};

/// Executes the failed command for one run (most recent by default).
pub fn execute(run: Option<String>, json: bool) -> Result<()> {
   let store = CheckpointStore::open_default()?;

   let run_id = match run {
      Some(id) => id,
      None => match store.list_runs(1)?.into_iter().next() {
         Some(latest) => latest.run_id,
         None => {
            println!("{}", style("No runs recorded").dim());
            return Ok(());
         },
      },
   };

   let failed = store.get_failed_all(&run_id)?;

   if json {
      println!("{}", serde_json::to_string_pretty(&failed)?);
      return Ok(());
   }

   if failed.is_empty() {
      println!("{} No failed lines for {}", style("✓").green(), style(run_id).bold());
      return Ok(());
   }

   println!("{} failed lines for {}:", failed.len(), style(&run_id).bold());
   println!();
   for line in &failed {
      let path = if line.path.is_empty() { "<unparsed line>" } else { line.path.as_str() };
      println!(
         "  {} {} {} {}",
         style(format!("#{}", line.line_no)).dim(),
         path,
         style(format!("[{} retries]", line.retry_count)).dim(),
         style(first_line(&line.error)).red()
      );
   }

   Ok(())
}

/// First line of an error message, clipped for terminal display.
fn first_line(error: &str) -> &str {
   let line = error.lines().next().unwrap_or(error);
   match line.char_indices().nth(120) {
      Some((idx, _)) => &line[..idx],
      None => line,
   }
}
