//! Content resolution: decides how each file's content travels to the
//! indexing backend.
//!
//! Every file lands in one of three tiers — raw inline text, transport-encoded
//! inline text, or reference-by-pointer for oversized files — or is skipped
//! outright (binary or vendored). The decision is made from file metadata
//! plus a bounded prefix sniff; oversized files are never read at all.

use std::{
   fs,
   io::Read,
   path::{Component, Path},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::{
   Result, config,
   error::Error,
   types::{ChangeOp, DocContent, FileChange, IndexDocument, InlineContent},
};

/// Extensions that are always treated as binary, without sniffing.
const BINARY_EXTENSIONS: &[&str] = &[
   "bin", "exe", "dll", "so", "dylib", "o", "a", "obj", "class", "jar", "wasm", "onnx",
   "safetensors", "png", "jpg", "jpeg", "gif", "webp", "ico", "bmp", "pdf", "zip", "tar", "gz",
   "bz2", "xz", "zst", "7z", "sqlite", "db", "mp3", "mp4", "avi", "mov", "woff", "woff2", "ttf",
   "eot", "pyc",
];

/// Directory names that mark vendored or generated trees.
const VENDOR_DIRS: &[&str] = &[
   "node_modules",
   "vendor",
   "third_party",
   "third-party",
   "dist",
   "build",
   "target",
   "__pycache__",
   ".git",
   ".venv",
   "venv",
];

/// Bytes of prefix inspected when sniffing for binary content.
const SNIFF_BYTES: usize = 8_192;

/// Why a file was excluded from indexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
   BinaryExtension,
   BinaryContent,
   Vendored,
}

impl SkipReason {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::BinaryExtension => "binary extension",
         Self::BinaryContent => "binary content",
         Self::Vendored => "vendored path",
      }
   }
}

/// How a file's content will be transmitted downstream.
///
/// Derived from metadata at resolution time; never persisted, recomputed per
/// invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentStrategy {
   /// Tier 1: small file, raw text embedded inline.
   Inline,
   /// Tier 2: mid-size file, base64-encoded inline.
   Encoded,
   /// Tier 3: oversized file, pointer + byte size only, content never read.
   Reference { size_bytes: u64 },
   /// Not indexed at all.
   Skip { reason: SkipReason },
}

impl ContentStrategy {
   /// Numeric tier for reporting; skipped files have none.
   pub const fn tier(self) -> Option<u8> {
      match self {
         Self::Inline => Some(1),
         Self::Encoded => Some(2),
         Self::Reference { .. } => Some(3),
         Self::Skip { .. } => None,
      }
   }

   pub const fn is_skip(self) -> bool {
      matches!(self, Self::Skip { .. })
   }
}

/// Resolves file paths into index-ready payloads
#[derive(Debug, Clone)]
pub struct ContentResolver {
   max_inline_bytes: u64,
   encode_threshold_bytes: u64,
   truncate_bytes: u64,
}

impl ContentResolver {
   pub const fn new(max_inline_bytes: u64, encode_threshold_bytes: u64, truncate_bytes: u64) -> Self {
      Self { max_inline_bytes, encode_threshold_bytes, truncate_bytes }
   }

   pub fn from_config() -> Self {
      let cfg = config::get();
      Self::new(
         cfg.effective_max_inline_bytes(),
         cfg.encode_threshold_bytes,
         cfg.effective_truncate_bytes(),
      )
   }

   /// Classifies a file into a processing tier from its metadata.
   ///
   /// Vendored and binary-by-extension paths are rejected before any
   /// filesystem access; oversized files are classified by size alone so
   /// their content is never opened. Only files that will actually be
   /// embedded get a bounded prefix sniff for binary content.
   pub fn analyze(&self, path: &Path) -> Result<ContentStrategy> {
      if is_vendored(path) {
         return Ok(ContentStrategy::Skip { reason: SkipReason::Vendored });
      }
      if has_binary_extension(path) {
         return Ok(ContentStrategy::Skip { reason: SkipReason::BinaryExtension });
      }

      let size_bytes = fs::metadata(path)?.len();
      if size_bytes > self.max_inline_bytes {
         return Ok(ContentStrategy::Reference { size_bytes });
      }

      if sniff_binary(path)? {
         return Ok(ContentStrategy::Skip { reason: SkipReason::BinaryContent });
      }

      if size_bytes > self.encode_threshold_bytes {
         Ok(ContentStrategy::Encoded)
      } else {
         Ok(ContentStrategy::Inline)
      }
   }

   /// Builds the submission record for one file change.
   ///
   /// Returns `Ok(None)` when the file is skipped (binary/vendored). Delete
   /// operations resolve no content. An unreadable file surfaces as an error
   /// the caller records as a per-line failure.
   pub async fn create_change(&self, change: &FileChange) -> Result<Option<IndexDocument>> {
      if change.op == ChangeOp::Delete {
         return Ok(Some(IndexDocument {
            path:    change.path.display().to_string(),
            op:      ChangeOp::Delete,
            repo:    change.repo.clone(),
            content: None,
            vector:  None,
         }));
      }

      let content = match &change.content {
         Some(InlineContent::Raw(text)) => Some(self.shape_text(text.clone().into_bytes())),
         Some(InlineContent::Base64(b64)) => {
            let bytes = BASE64.decode(b64).map_err(|e| Error::Encoding {
               path:   change.path.display().to_string(),
               reason: format!("invalid base64: {e}"),
            })?;
            Some(self.shape_text(bytes))
         },
         Some(InlineContent::Ref(target)) => self.resolve_path(target).await?,
         None => self.resolve_path(&change.path).await?,
      };

      // Skipped entirely.
      let Some(content) = content else {
         return Ok(None);
      };

      Ok(Some(IndexDocument {
         path: change.path.display().to_string(),
         op: change.op,
         repo: change.repo.clone(),
         content: Some(content),
         vector: None,
      }))
   }

   async fn resolve_path(&self, path: &Path) -> Result<Option<DocContent>> {
      match self.analyze(path)? {
         ContentStrategy::Skip { reason } => {
            tracing::debug!("skipping {}: {}", path.display(), reason.as_str());
            Ok(None)
         },
         ContentStrategy::Reference { size_bytes } => {
            Ok(Some(DocContent::Reference { size_bytes }))
         },
         ContentStrategy::Inline | ContentStrategy::Encoded => {
            let bytes = tokio::fs::read(path).await?;
            Ok(Some(self.shape_text(bytes)))
         },
      }
   }

   /// Applies truncation and tier shaping to in-memory content.
   fn shape_text(&self, mut bytes: Vec<u8>) -> DocContent {
      let truncate_at = self.truncate_bytes as usize;
      if bytes.len() > truncate_at {
         bytes.truncate(truncate_at);
      }

      if bytes.len() as u64 > self.encode_threshold_bytes {
         DocContent::Encoded { base64: BASE64.encode(&bytes) }
      } else {
         let mut text = String::from_utf8_lossy(&bytes).into_owned();
         trim_to_char_boundary(&mut text, truncate_at);
         DocContent::Inline { text }
      }
   }
}

fn has_binary_extension(path: &Path) -> bool {
   let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
   BINARY_EXTENSIONS.iter().any(|&e| ext.eq_ignore_ascii_case(e))
}

fn is_vendored(path: &Path) -> bool {
   path.components().any(|c| match c {
      Component::Normal(name) => name
         .to_str()
         .is_some_and(|n| VENDOR_DIRS.iter().any(|&d| n.eq_ignore_ascii_case(d))),
      _ => false,
   })
}

/// Reads a bounded prefix and reports whether it looks like binary data.
fn sniff_binary(path: &Path) -> Result<bool> {
   let mut file = fs::File::open(path)?;
   let mut buf = [0u8; SNIFF_BYTES];
   let n = file.read(&mut buf)?;
   Ok(buf[..n].contains(&0))
}

fn trim_to_char_boundary(text: &mut String, max: usize) {
   if text.len() <= max {
      return;
   }
   let mut cut = max;
   while cut > 0 && !text.is_char_boundary(cut) {
      cut -= 1;
   }
   text.truncate(cut);
}
