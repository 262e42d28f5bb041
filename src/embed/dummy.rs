//! Lightweight deterministic embedder for tests and tooling.

use crate::{embed::Embedder, error::Result};

#[derive(Debug, Clone)]
pub struct DummyEmbedder {
   dim: usize,
}

impl DummyEmbedder {
   pub fn new(dim: usize) -> Self {
      Self { dim }
   }
}

#[async_trait::async_trait]
impl Embedder for DummyEmbedder {
   async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
      let mut out = Vec::with_capacity(texts.len());
      for text in texts {
         let mut dense = vec![0.0; self.dim];
         if !dense.is_empty() {
            dense[0] = text.len() as f32;
         }
         out.push(dense);
      }
      Ok(out)
   }
}
