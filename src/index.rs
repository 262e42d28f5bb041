//! Indexing backend boundary: trait, HTTP client, in-memory double.
//!
//! The backend stores one document per path in a named collection and serves
//! semantic search over it. The orchestrator only needs three capabilities:
//! batch upsert, per-path delete, and a liveness check. [`HttpIndexer`]
//! speaks a Qdrant-compatible REST dialect; [`MemoryIndexer`] backs tests
//! and tooling.

use std::{
   collections::{HashMap, HashSet},
   sync::atomic::{AtomicBool, AtomicU32, Ordering},
   time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
   Result, config,
   error::Error,
   types::{DocContent, IndexDocument},
};

/// Vector size used when a collection must be created before any embedding
/// has been seen (skip-embedding runs).
const DEFAULT_VECTOR_DIM: usize = 384;

/// Write access to the external indexing backend.
#[async_trait]
pub trait Indexer: Send + Sync {
   /// Upserts a batch of documents into a collection. The batch is one
   /// request; per-item attribution is the caller's concern.
   async fn index_batch(&self, collection: &str, documents: &[IndexDocument]) -> Result<()>;

   /// Removes the document stored for a path. Deleting an absent path is
   /// not an error.
   async fn delete(&self, collection: &str, path: &str) -> Result<()>;

   /// Backend liveness check.
   async fn health(&self) -> Result<()>;
}

// Lets callers hand the orchestrator a shared backend and keep a handle.
#[async_trait]
impl<T: Indexer + ?Sized> Indexer for std::sync::Arc<T> {
   async fn index_batch(&self, collection: &str, documents: &[IndexDocument]) -> Result<()> {
      (**self).index_batch(collection, documents).await
   }

   async fn delete(&self, collection: &str, path: &str) -> Result<()> {
      (**self).delete(collection, path).await
   }

   async fn health(&self) -> Result<()> {
      (**self).health().await
   }
}

/// Stable point identifier for a document within a collection.
pub fn point_id(collection: &str, path: &str) -> u64 {
   let mut hasher = Sha256::new();
   hasher.update(collection.as_bytes());
   hasher.update([0u8]);
   hasher.update(path.as_bytes());
   let digest = hasher.finalize();
   u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

// ─── HTTP client ────────────────────────────────────────────────────────────

/// Qdrant-style REST client for the indexing backend.
pub struct HttpIndexer {
   http:     reqwest::Client,
   base_url: String,
}

impl HttpIndexer {
   pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
      let http = reqwest::Client::builder().timeout(timeout).build()?;
      Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
   }

   pub fn from_config() -> Result<Self> {
      let cfg = config::get();
      Self::new(&cfg.backend_url, Duration::from_millis(cfg.request_timeout_ms))
   }

   fn collection_url(&self, collection: &str) -> String {
      format!("{}/collections/{collection}", self.base_url)
   }

   fn points_url(&self, collection: &str) -> String {
      format!("{}/collections/{collection}/points?wait=true", self.base_url)
   }

   fn delete_url(&self, collection: &str) -> String {
      format!("{}/collections/{collection}/points/delete?wait=true", self.base_url)
   }

   /// Read-only probe for whether the collection exists.
   ///
   /// Creation stays lazy: the first upsert against a missing collection
   /// creates it with the observed vector size.
   pub async fn collection_exists(&self, collection: &str) -> Result<bool> {
      let resp = self.http.get(self.collection_url(collection)).send().await?;
      match resp.status().as_u16() {
         s if (200..300).contains(&s) => Ok(true),
         404 => Ok(false),
         status => Err(backend_error("collection_exists", status, resp).await),
      }
   }

   async fn create_collection(&self, collection: &str, vector_size: usize) -> Result<()> {
      let body = CreateCollectionRequest {
         vectors: VectorParams { size: vector_size, distance: "Cosine" },
      };
      let resp = self
         .http
         .put(self.collection_url(collection))
         .json(&body)
         .send()
         .await?;
      if !resp.status().is_success() {
         let status = resp.status().as_u16();
         return Err(backend_error("create_collection", status, resp).await);
      }
      tracing::info!(collection, vector_size, "created collection");
      Ok(())
   }

   async fn upsert(&self, collection: &str, points: &[Point<'_>]) -> Result<reqwest::Response> {
      Ok(self
         .http
         .put(self.points_url(collection))
         .json(&UpsertRequest { points })
         .send()
         .await?)
   }
}

#[async_trait]
impl Indexer for HttpIndexer {
   async fn index_batch(&self, collection: &str, documents: &[IndexDocument]) -> Result<()> {
      if documents.is_empty() {
         return Ok(());
      }

      let points: Vec<Point<'_>> = documents
         .iter()
         .map(|doc| Point {
            id:      point_id(collection, &doc.path),
            vector:  doc.vector.as_deref(),
            payload: PointPayload {
               path:    &doc.path,
               repo:    doc.repo.as_deref(),
               content: doc.content.as_ref(),
            },
         })
         .collect();

      let mut resp = self.upsert(collection, &points).await?;
      if resp.status().as_u16() == 404 {
         // First write against a fresh backend: create and retry once.
         let dim = documents
            .iter()
            .find_map(|d| d.vector.as_ref().map(Vec::len))
            .unwrap_or(DEFAULT_VECTOR_DIM);
         self.create_collection(collection, dim).await?;
         resp = self.upsert(collection, &points).await?;
      }

      if !resp.status().is_success() {
         let status = resp.status().as_u16();
         return Err(backend_error("index_batch", status, resp).await);
      }
      Ok(())
   }

   async fn delete(&self, collection: &str, path: &str) -> Result<()> {
      let body = DeleteRequest {
         filter: Filter { must: vec![Condition { key: "path", r#match: MatchValue { value: path } }] },
      };
      let resp = self
         .http
         .post(self.delete_url(collection))
         .json(&body)
         .send()
         .await?;

      match resp.status().as_u16() {
         s if (200..300).contains(&s) => Ok(()),
         // Nothing to delete is success for our purposes.
         404 => Ok(()),
         status => Err(backend_error("delete", status, resp).await),
      }
   }

   async fn health(&self) -> Result<()> {
      let resp = self.http.get(format!("{}/healthz", self.base_url)).send().await?;
      if !resp.status().is_success() {
         let status = resp.status().as_u16();
         return Err(backend_error("health", status, resp).await);
      }
      Ok(())
   }
}

async fn backend_error(op: &'static str, status: u16, resp: reqwest::Response) -> Error {
   let reason = resp.text().await.unwrap_or_default();
   Error::Backend { op, status, reason }
}

// ─── Wire types ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct UpsertRequest<'a> {
   points: &'a [Point<'a>],
}

#[derive(Serialize)]
struct Point<'a> {
   id: u64,
   #[serde(skip_serializing_if = "Option::is_none")]
   vector:  Option<&'a [f32]>,
   payload: PointPayload<'a>,
}

#[derive(Serialize)]
struct PointPayload<'a> {
   path: &'a str,
   #[serde(skip_serializing_if = "Option::is_none")]
   repo: Option<&'a str>,
   // Flattened: None emits no fields at all.
   #[serde(flatten)]
   content: Option<&'a DocContent>,
}

#[derive(Serialize)]
struct CreateCollectionRequest {
   vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
   size:     usize,
   distance: &'static str,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
   filter: Filter<'a>,
}

#[derive(Serialize)]
struct Filter<'a> {
   must: Vec<Condition<'a>>,
}

#[derive(Serialize)]
struct Condition<'a> {
   key:     &'static str,
   r#match: MatchValue<'a>,
}

#[derive(Serialize)]
struct MatchValue<'a> {
   value: &'a str,
}

// ─── In-memory double ───────────────────────────────────────────────────────

/// Deterministic in-memory backend for tests and tooling.
///
/// Supports injected failures: the next N batch calls can be made to fail,
/// and batches touching specific paths can be rejected, to exercise the
/// retry and partial-failure paths without a network.
#[derive(Default)]
pub struct MemoryIndexer {
   docs: Mutex<HashMap<String, HashMap<String, IndexDocument>>>,
   fail_batches: AtomicU32,
   fail_paths:   Mutex<HashSet<String>>,
   unhealthy:    AtomicBool,
}

impl MemoryIndexer {
   pub fn new() -> Self {
      Self::default()
   }

   /// The next `n` `index_batch` calls fail with a backend error.
   pub fn fail_next_batches(&self, n: u32) {
      self.fail_batches.store(n, Ordering::SeqCst);
   }

   /// Batches containing `path` (and deletes of it) fail until cleared.
   pub fn fail_path(&self, path: &str) {
      self.fail_paths.lock().insert(path.to_string());
   }

   pub fn clear_failures(&self) {
      self.fail_batches.store(0, Ordering::SeqCst);
      self.fail_paths.lock().clear();
   }

   pub fn set_healthy(&self, healthy: bool) {
      self.unhealthy.store(!healthy, Ordering::SeqCst);
   }

   /// Document currently stored for a path, if any.
   pub fn document(&self, collection: &str, path: &str) -> Option<IndexDocument> {
      self.docs.lock().get(collection)?.get(path).cloned()
   }

   pub fn len(&self, collection: &str) -> usize {
      self.docs.lock().get(collection).map_or(0, HashMap::len)
   }

   pub fn is_empty(&self, collection: &str) -> bool {
      self.len(collection) == 0
   }

   pub fn paths(&self, collection: &str) -> Vec<String> {
      let mut paths: Vec<String> = self
         .docs
         .lock()
         .get(collection)
         .map(|docs| docs.keys().cloned().collect())
         .unwrap_or_default();
      paths.sort();
      paths
   }
}

#[async_trait]
impl Indexer for MemoryIndexer {
   async fn index_batch(&self, collection: &str, documents: &[IndexDocument]) -> Result<()> {
      if documents.is_empty() {
         return Ok(());
      }

      let budget = self
         .fail_batches
         .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
      if budget.is_ok() {
         return Err(Error::Backend {
            op:     "index_batch",
            status: 503,
            reason: "injected batch failure".to_string(),
         });
      }

      {
         let failing = self.fail_paths.lock();
         if let Some(doc) = documents.iter().find(|d| failing.contains(&d.path)) {
            return Err(Error::Backend {
               op:     "index_batch",
               status: 500,
               reason: format!("injected failure for {}", doc.path),
            });
         }
      }

      let mut docs = self.docs.lock();
      let entry = docs.entry(collection.to_string()).or_default();
      for doc in documents {
         entry.insert(doc.path.clone(), doc.clone());
      }
      Ok(())
   }

   async fn delete(&self, collection: &str, path: &str) -> Result<()> {
      if self.fail_paths.lock().contains(path) {
         return Err(Error::Backend {
            op:     "delete",
            status: 500,
            reason: format!("injected failure for {path}"),
         });
      }
      if let Some(docs) = self.docs.lock().get_mut(collection) {
         docs.remove(path);
      }
      Ok(())
   }

   async fn health(&self) -> Result<()> {
      if self.unhealthy.load(Ordering::SeqCst) {
         return Err(Error::Backend {
            op:     "health",
            status: 503,
            reason: "injected outage".to_string(),
         });
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::types::ChangeOp;

   fn doc(path: &str) -> IndexDocument {
      IndexDocument {
         path:    path.to_string(),
         op:      ChangeOp::Add,
         repo:    None,
         content: Some(DocContent::Inline { text: "fn main() {}".to_string() }),
         vector:  Some(vec![0.1, 0.2]),
      }
   }

   #[test]
   fn point_ids_are_stable_and_collection_scoped() {
      let a = point_id("main", "src/lib.rs");
      assert_eq!(a, point_id("main", "src/lib.rs"));
      assert_ne!(a, point_id("other", "src/lib.rs"));
      assert_ne!(a, point_id("main", "src/main.rs"));
   }

   #[test]
   fn points_serialize_without_missing_fields() {
      let d = doc("src/lib.rs");
      let point = Point {
         id:      point_id("main", &d.path),
         vector:  d.vector.as_deref(),
         payload: PointPayload { path: &d.path, repo: None, content: d.content.as_ref() },
      };
      let json = serde_json::to_value(&point).unwrap();

      assert_eq!(json["payload"]["path"], "src/lib.rs");
      assert_eq!(json["payload"]["kind"], "inline");
      assert_eq!(json["payload"]["text"], "fn main() {}");
      assert!(json["payload"].get("repo").is_none());
      assert_eq!(json["vector"][1], 0.2);
   }

   #[test]
   fn reference_points_omit_vector() {
      let d = IndexDocument {
         path:    "big.log".to_string(),
         op:      ChangeOp::Modify,
         repo:    Some("core".to_string()),
         content: Some(DocContent::Reference { size_bytes: 2_000_000 }),
         vector:  None,
      };
      let point = Point {
         id:      point_id("main", &d.path),
         vector:  d.vector.as_deref(),
         payload: PointPayload { path: &d.path, repo: d.repo.as_deref(), content: d.content.as_ref() },
      };
      let json = serde_json::to_value(&point).unwrap();

      assert!(json.get("vector").is_none());
      assert_eq!(json["payload"]["kind"], "reference");
      assert_eq!(json["payload"]["size_bytes"], 2_000_000);
      assert_eq!(json["payload"]["repo"], "core");
   }

   #[tokio::test]
   async fn memory_indexer_upserts_and_deletes() {
      let indexer = MemoryIndexer::new();
      indexer.index_batch("main", &[doc("a.rs"), doc("b.rs")]).await.unwrap();
      assert_eq!(indexer.len("main"), 2);

      // Upsert replaces, never duplicates.
      indexer.index_batch("main", &[doc("a.rs")]).await.unwrap();
      assert_eq!(indexer.len("main"), 2);

      indexer.delete("main", "a.rs").await.unwrap();
      assert_eq!(indexer.paths("main"), vec!["b.rs"]);

      // Deleting an absent path is fine.
      indexer.delete("main", "missing.rs").await.unwrap();
   }

   #[tokio::test]
   async fn memory_indexer_injects_batch_failures() {
      let indexer = MemoryIndexer::new();
      indexer.fail_next_batches(1);

      let err = indexer.index_batch("main", &[doc("a.rs")]).await.unwrap_err();
      assert!(matches!(err, Error::Backend { status: 503, .. }));
      assert!(indexer.is_empty("main"));

      // Second call succeeds.
      indexer.index_batch("main", &[doc("a.rs")]).await.unwrap();
      assert_eq!(indexer.len("main"), 1);
   }

   #[tokio::test]
   async fn memory_indexer_rejects_failing_paths() {
      let indexer = MemoryIndexer::new();
      indexer.fail_path("bad.rs");

      let err = indexer
         .index_batch("main", &[doc("good.rs"), doc("bad.rs")])
         .await
         .unwrap_err();
      assert!(matches!(err, Error::Backend { status: 500, .. }));

      indexer.clear_failures();
      indexer.index_batch("main", &[doc("bad.rs")]).await.unwrap();
      assert_eq!(indexer.len("main"), 1);
   }

   #[tokio::test]
   async fn memory_indexer_health_toggles() {
      let indexer = MemoryIndexer::new();
      indexer.health().await.unwrap();

      indexer.set_healthy(false);
      assert!(indexer.health().await.is_err());
   }
}
