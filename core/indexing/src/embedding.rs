use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Text to fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embeddings from an Ollama server, cached per input text.
pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl OllamaEmbedder {
    pub fn new(base_url: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cached = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(text)
            .cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Ollama embedding error: {}", error_text));
        }

        let body: OllamaEmbeddingResponse = response.json().await?;
        if body.embedding.is_empty() {
            return Err(anyhow!("Empty embedding from Ollama for model {}", self.model));
        }

        debug!("Embedded {} chars into {} dims", text.len(), body.embedding.len());
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(text.to_string(), body.embedding.clone());
        Ok(body.embedding)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Offline bag-of-tokens embedding.
///
/// Every lowercase whitespace token is hashed into one bucket, then the
/// vector is L2-normalized. Texts with no tokens in common land near zero.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(bytes) % self.dimensions as u64) as usize
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embedding = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            embedding[self.bucket(&token.to_lowercase())] += 1.0;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            embedding.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(embedding)
    }
}

/// Cosine similarity; zero for mismatched lengths or a zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
