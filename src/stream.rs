//! Input-stream parsing for file-change records.
//!
//! Each line is one of: a bare file path (defaulting to a `modify`
//! operation), a JSON change object, or a JSON `new_changeset` object
//! carrying opaque run metadata. The variant is decided here, once; nothing
//! downstream re-inspects raw lines.

use std::path::PathBuf;

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::{
   Result,
   error::Error,
   types::{Change, ChangeOp, ChangesetMeta, FileChange, InlineContent},
};

/// Wire shape of a JSON input line before validation
#[derive(Debug, Deserialize)]
struct RawLine {
   line:           Option<u64>,
   path:           Option<String>,
   op:             Option<String>,
   repo:           Option<String>,
   content:        Option<String>,
   content_base64: Option<String>,
   content_ref:    Option<String>,
   new_changeset:  Option<serde_json::Value>,
}

/// Parses one non-blank input line into a change record.
///
/// `position` is the line's stream position, used when the record carries no
/// explicit `line` field.
pub fn parse_line(raw: &str, position: u64) -> Result<Change> {
   let trimmed = raw.trim();

   if !trimmed.starts_with('{') {
      return Ok(Change::File(FileChange {
         line_no: position,
         path:    PathBuf::from(trimmed),
         op:      ChangeOp::Modify,
         repo:    None,
         content: None,
      }));
   }

   let parsed: RawLine = serde_json::from_str(trimmed).map_err(|e| Error::Validation {
      line_no: position,
      reason:  format!("malformed json: {e}"),
   })?;

   let line_no = parsed.line.unwrap_or(position);

   if let Some(blob) = parsed.new_changeset {
      return Ok(Change::Changeset(ChangesetMeta { line_no, blob }));
   }

   let Some(path) = parsed.path else {
      return Err(Error::Validation { line_no, reason: "missing path".to_string() });
   };
   if path.is_empty() {
      return Err(Error::Validation { line_no, reason: "empty path".to_string() });
   }

   let op = match parsed.op.as_deref() {
      None => ChangeOp::Modify,
      Some(raw_op) => ChangeOp::parse(raw_op).ok_or_else(|| Error::Validation {
         line_no,
         reason: format!("unknown op: {raw_op}"),
      })?,
   };

   let content = parse_content(parsed.content, parsed.content_base64, parsed.content_ref, line_no)?;

   Ok(Change::File(FileChange { line_no, path: PathBuf::from(path), op, repo: parsed.repo, content }))
}

fn parse_content(
   content: Option<String>,
   content_base64: Option<String>,
   content_ref: Option<String>,
   line_no: u64,
) -> Result<Option<InlineContent>> {
   let supplied =
      usize::from(content.is_some()) + usize::from(content_base64.is_some()) + usize::from(content_ref.is_some());
   if supplied > 1 {
      return Err(Error::Validation {
         line_no,
         reason: "at most one of content, content_base64, content_ref allowed".to_string(),
      });
   }

   Ok(match (content, content_base64, content_ref) {
      (Some(text), _, _) => Some(InlineContent::Raw(text)),
      (_, Some(b64), _) => Some(InlineContent::Base64(b64)),
      (_, _, Some(path)) => Some(InlineContent::Ref(PathBuf::from(path))),
      _ => None,
   })
}

/// Lazily yields parsed changes from a line-oriented reader.
///
/// Blank lines are skipped without consuming a stream position. Parse errors
/// surface as [`Error::Validation`] carrying the offending line number so the
/// caller can record a per-line failure and continue.
pub struct ChangeStream<R> {
   lines:    Lines<R>,
   position: u64,
}

impl<R: AsyncBufRead + Unpin> ChangeStream<R> {
   pub fn new(reader: R) -> Self {
      Self { lines: reader.lines(), position: 0 }
   }

   /// Line number the next non-blank line will receive.
   pub const fn next_position(&self) -> u64 {
      self.position + 1
   }

   pub async fn next_change(&mut self) -> Result<Option<Change>> {
      loop {
         let Some(raw) = self.lines.next_line().await? else {
            return Ok(None);
         };
         if raw.trim().is_empty() {
            continue;
         }
         self.position += 1;
         return parse_line(&raw, self.position).map(Some);
      }
   }
}
