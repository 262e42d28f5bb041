use std::io;

use thiserror::Error;

/// Main error type for the gsync application.
///
/// This enum represents all possible errors that can occur throughout the
/// pipeline, including I/O operations, checkpoint persistence, content
/// resolution, input parsing, and calls to the external embedding and
/// indexing services.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during file or network operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// TOML serialization or deserialization error occurred.
   #[error("toml error: {0}")]
   Toml(#[from] toml::de::Error),

   /// Checkpoint database operation failed.
   #[error("checkpoint error: {0}")]
   Checkpoint(#[from] rusqlite::Error),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// HTTP transport failed before a response was received.
   #[error("request error: {0}")]
   Request(#[from] reqwest::Error),

   /// The backend answered with a non-success status.
   #[error("backend error during {op}: HTTP {status}: {reason}")]
   Backend {
      op:     &'static str,
      status: u16,
      reason: String,
   },

   /// The embedding service returned an unusable response.
   #[error("embedding error during {op}: {reason}")]
   Embed { op: &'static str, reason: String },

   /// Content could not be transport-encoded or decoded.
   #[error("encoding error for {path}: {reason}")]
   Encoding { path: String, reason: String },

   /// An input line failed structural validation.
   #[error("invalid input at line {line_no}: {reason}")]
   Validation { line_no: u64, reason: String },

   /// The circuit breaker is open for this operation.
   #[error("circuit open for {op}: failing fast")]
   CircuitOpen { op: &'static str },

   /// No run with the given identifier exists in the checkpoint store.
   #[error("run not found: {0}")]
   RunNotFound(String),

   /// The sync loop was interrupted; the run remains resumable.
   #[error("sync interrupted; run {run_id} left resumable")]
   Interrupted { run_id: String },

   /// Error already reported to the user (e.g., JSON output emitted).
   #[error("{message}")]
   Reported { message: String, exit_code: i32 },
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      if let Error::Reported { exit_code, .. } = self {
         return *exit_code;
      }

      let reason = self.to_string().to_lowercase();

      if reason.contains("busy") || reason.contains("locked") {
         10
      } else if reason.contains("timeout") || reason.contains("timed out") {
         11
      } else if reason.contains("interrupt") || reason.contains("cancel") {
         12
      } else {
         1
      }
   }

   /// Structured HTTP status attached to this error, when one exists.
   ///
   /// Used by the retry classifier so that status codes take precedence over
   /// message-text matching.
   pub fn http_status(&self) -> Option<u16> {
      match self {
         Error::Backend { status, .. } => Some(*status),
         Error::Request(e) => e.status().map(|s| s.as_u16()),
         _ => None,
      }
   }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Failed to retrieve user directories (e.g., home directory).
   #[error("failed to get user directories")]
   GetUserDirectories,

   /// Config is invalid or exceeds safety caps.
   #[error("invalid config: {0}")]
   InvalidConfig(String),
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
