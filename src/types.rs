use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Kind of file change carried by an input line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
   Add,
   Modify,
   Delete,
}

impl ChangeOp {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Add => "add",
         Self::Modify => "modify",
         Self::Delete => "delete",
      }
   }

   pub fn parse(s: &str) -> Option<Self> {
      match s {
         "add" => Some(Self::Add),
         "modify" => Some(Self::Modify),
         "delete" => Some(Self::Delete),
         _ => None,
      }
   }
}

/// Content supplied inline on an input line, before resolution.
///
/// Exactly one form may be present per line; the resolver decides how the
/// final payload is shaped regardless of which form arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InlineContent {
   /// Raw text supplied in the `content` field.
   Raw(String),
   /// Base64-encoded text supplied in the `content_base64` field.
   Base64(String),
   /// Path to resolve separately, supplied in the `content_ref` field.
   Ref(PathBuf),
}

/// A single file-change record parsed from the input stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
   pub line_no: u64,
   pub path:    PathBuf,
   pub op:      ChangeOp,
   pub repo:    Option<String>,
   pub content: Option<InlineContent>,
}

/// Opaque changeset metadata attached to a run by the upstream producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesetMeta {
   pub line_no: u64,
   pub blob:    serde_json::Value,
}

/// One parsed input line.
///
/// The variant is decided once at parse time; downstream code never
/// re-inspects the raw line.
#[derive(Debug, Clone)]
pub enum Change {
   File(FileChange),
   Changeset(ChangesetMeta),
}

/// Document content as transmitted to the indexing backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DocContent {
   /// Tier 1: raw text embedded inline.
   Inline { text: String },
   /// Tier 2: transport-encoded text embedded inline.
   Encoded { base64: String },
   /// Tier 3: content stays at the source; the backend gets a pointer.
   Reference { size_bytes: u64 },
}

/// A single document submission for the indexing backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
   pub path:    String,
   pub op:      ChangeOp,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub repo:    Option<String>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub content: Option<DocContent>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub vector:  Option<Vec<f32>>,
}

impl IndexDocument {
   /// Text to feed the embedding service, when this document carries any.
   ///
   /// Reference and delete documents produce no embedding input.
   pub fn embedding_text(&self) -> Option<&str> {
      match &self.content {
         Some(DocContent::Inline { text }) => Some(text),
         Some(DocContent::Encoded { base64 }) => Some(base64),
         _ => None,
      }
   }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
   Running,
   Completed,
}

impl RunStatus {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Running => "running",
         Self::Completed => "completed",
      }
   }

   pub fn parse(s: &str) -> Option<Self> {
      match s {
         "running" => Some(Self::Running),
         "completed" => Some(Self::Completed),
         _ => None,
      }
   }
}

/// Durable record of one pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
   pub run_id:       String,
   pub collection:   String,
   pub dry_run:      bool,
   pub source:       String,
   pub status:       RunStatus,
   pub started_at:   String,
   pub completed_at: Option<String>,
   pub processed:    u64,
   pub succeeded:    u64,
   pub failed:       u64,
   /// Opaque upstream changeset metadata, stored without interpretation.
   pub changeset:    Option<String>,
}

/// Durable record of a line that has not yet completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedLine {
   pub run_id:      String,
   pub line_no:     u64,
   pub path:        String,
   pub op:          ChangeOp,
   pub repo:        Option<String>,
   pub error:       String,
   pub payload:     String,
   pub retry_count: u32,
   pub last_try_at: String,
}

/// Progress tracking for a sync in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
   pub processed: u64,
   pub succeeded: u64,
   pub failed:    u64,
   pub current:   Option<String>,
}
