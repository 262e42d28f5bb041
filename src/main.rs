use clap::{Parser, Subcommand};
use gsync::{
   Error, Result,
   cmd::{self, sync::SyncArgs},
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the gsync application
#[derive(Parser)]
#[command(name = "gsync")]
#[command(about = "Durable change-stream sync into semantic search backends")]
#[command(version)]
struct Cli {
   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for gsync
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Sync a change stream from stdin into the backend")]
   Sync {
      #[arg(
         short = 'c',
         long,
         env = "GSYNC_COLLECTION",
         help = "Target collection (default from config)"
      )]
      collection: Option<String>,

      #[arg(long, help = "Label recorded as the stream source")]
      source: Option<String>,

      #[arg(short = 'n', long, help = "Resolve and validate without writing anything")]
      dry_run: bool,

      #[arg(short = 'b', long, help = "Lines per indexing batch")]
      batch_size: Option<usize>,

      #[arg(long, help = "Retry ceiling for replaying failed lines")]
      max_retries: Option<u32>,

      #[arg(long, help = "Index documents without embedding vectors")]
      skip_embedding: bool,

      #[arg(long, help = "Start a fresh run even if one is resumable")]
      no_resume: bool,

      #[arg(long, help = "JSON summary output")]
      json: bool,
   },

   #[command(about = "Show recent runs and their counters")]
   Status {
      #[arg(short = 'l', long, default_value = "10", help = "Maximum runs to list")]
      limit: usize,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "List failed lines for a run")]
   Failed {
      #[arg(long, help = "Run id (default: most recent run)")]
      run: Option<String>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Delete run records older than the retention window")]
   Cleanup {
      #[arg(long, help = "Retention in days (default from config)")]
      days: Option<u32>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Check configuration, checkpoint store, and backends")]
   Doctor,
}

#[tokio::main]
async fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
      .init();

   let cli = Cli::parse();
   if let Err(err) = run(cli).await {
      if !matches!(err, Error::Reported { .. }) {
         eprintln!("{err}");
      }
      std::process::exit(err.exit_code());
   }
}

async fn run(cli: Cli) -> Result<()> {
   match cli.command {
      Cmd::Sync {
         collection,
         source,
         dry_run,
         batch_size,
         max_retries,
         skip_embedding,
         no_resume,
         json,
      } => {
         cmd::sync::execute(SyncArgs {
            collection,
            source,
            dry_run,
            batch_size,
            max_retries,
            skip_embedding,
            no_resume,
            json,
         })
         .await
      },
      Cmd::Status { limit, json } => cmd::status::execute(limit, json),
      Cmd::Failed { run, json } => cmd::failed::execute(run, json),
      Cmd::Cleanup { days, json } => cmd::cleanup::execute(days, json),
      Cmd::Doctor => cmd::doctor::execute().await,
   }
}
