//! Embedding service boundary: trait + OpenAI-compatible HTTP client.

pub mod dummy;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Result, config, error::Error};

/// Turns text into dense vectors for the indexing backend.
#[async_trait]
pub trait Embedder: Send + Sync {
   /// Embeds a batch of texts; one vector per input, in input order.
   async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

#[async_trait]
impl<T: Embedder + ?Sized> Embedder for std::sync::Arc<T> {
   async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
      (**self).embed(texts).await
   }
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
   http:     reqwest::Client,
   base_url: String,
   model:    String,
}

impl HttpEmbedder {
   pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
      let http = reqwest::Client::builder().timeout(timeout).build()?;
      Ok(Self {
         http,
         base_url: base_url.trim_end_matches('/').to_string(),
         model: model.to_string(),
      })
   }

   pub fn from_config() -> Result<Self> {
      let cfg = config::get();
      Self::new(&cfg.embed_url, &cfg.embed_model, Duration::from_millis(cfg.request_timeout_ms))
   }

   fn embeddings_url(&self) -> String {
      format!("{}/embeddings", self.base_url)
   }
}

#[async_trait]
impl Embedder for HttpEmbedder {
   async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
      if texts.is_empty() {
         return Ok(Vec::new());
      }

      let request = EmbeddingsRequest {
         model: &self.model,
         input: texts.iter().map(|t| (*t).to_string()).collect(),
      };
      let resp = self.http.post(self.embeddings_url()).json(&request).send().await?;

      if !resp.status().is_success() {
         let status = resp.status().as_u16();
         let reason = resp.text().await.unwrap_or_default();
         return Err(Error::Backend { op: "embed", status, reason });
      }

      let parsed: EmbeddingsResponse = resp
         .json()
         .await
         .map_err(|e| Error::Embed { op: "embed", reason: e.to_string() })?;
      if parsed.data.len() != texts.len() {
         return Err(Error::Embed {
            op:     "embed",
            reason: format!("sent {} texts, got {} embeddings", texts.len(), parsed.data.len()),
         });
      }

      // Some servers return entries out of order; the index field decides.
      let mut data = parsed.data;
      data.sort_by_key(|d| d.index.unwrap_or(0));

      let dim = data.first().map_or(0, |d| d.embedding.len());
      let mut vectors = Vec::with_capacity(data.len());
      for datum in data {
         if datum.embedding.len() != dim {
            return Err(Error::Embed {
               op:     "embed",
               reason: format!("dimension mismatch: {} vs {dim}", datum.embedding.len()),
            });
         }
         vectors.push(datum.embedding);
      }
      Ok(vectors)
   }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
   model: &'a str,
   input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
   data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
   #[serde(default)]
   index: Option<usize>,
   #[serde(default)]
   embedding: Vec<f32>,
}
