// Embeddings
// Pluggable embedding providers behind one batch-oriented trait. The
// production provider talks to an OpenAI-compatible HTTP endpoint; the
// hash provider is deterministic and offline, for tests and dry runs.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::SupertagError;

/// Configuration for the remote embedding sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub max_batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1".to_string(),
            model: "nomic-embed-text".to_string(),
            api_key: None,
            max_batch_size: 32,
            timeout_secs: 30,
        }
    }
}

/// Result of one embedding batch.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model_used: String,
    pub tokens_used: Option<usize>,
}

/// Batch-oriented embedding provider.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts, one vector per input,
    /// in input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let result = self.embed_texts(std::slice::from_ref(&text.to_string())).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no embedding returned"))
    }

    fn model_name(&self) -> &str;

    fn max_batch_size(&self) -> usize;
}

/// Provider for OpenAI-compatible `/embeddings` endpoints.
#[derive(Debug)]
pub struct RemoteEmbeddingProvider {
    config: EmbeddingConfig,
    client: reqwest::Client,
}

impl RemoteEmbeddingProvider {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        url::Url::parse(&config.endpoint).map_err(|e| {
            SupertagError::ConfigInvalid(format!(
                "embedding endpoint '{}': {e}",
                config.endpoint
            ))
        })?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: usize,
}

#[async_trait::async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult {
                embeddings: Vec::new(),
                model_used: self.config.model.clone(),
                tokens_used: Some(0),
            });
        }

        let url = format!("{}/embeddings", self.config.endpoint.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            input: texts,
            model: &self.config.model,
            encoding_format: "float",
        });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::Error::new(SupertagError::Timeout(format!("embedding request: {e}")))
            } else {
                anyhow::Error::new(SupertagError::NetworkError(format!(
                    "embedding request: {e}"
                )))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = match status.as_u16() {
                401 | 403 => SupertagError::AuthFailed(format!("embedding sink: {body}")),
                429 => SupertagError::RateLimited(format!("embedding sink: {body}")),
                _ => SupertagError::ApiError(format!("embedding sink {status}: {body}")),
            };
            return Err(err.into());
        }

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            SupertagError::ApiError(format!("embedding response decode: {e}"))
        })?;
        if parsed.data.len() != texts.len() {
            return Err(SupertagError::ApiError(format!(
                "embedding sink returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            ))
            .into());
        }
        parsed.data.sort_by_key(|d| d.index);

        Ok(EmbeddingResult {
            embeddings: parsed.data.into_iter().map(|d| d.embedding).collect(),
            model_used: self.config.model.clone(),
            tokens_used: parsed.usage.map(|u| u.total_tokens),
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }
}

/// Deterministic offline provider: vectors are derived from a SHA-256
/// stream over the input text. Similar only to identical text, which is
/// exactly what incremental-generation tests need.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    pub dimension: usize,
    pub max_batch_size: usize,
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self {
            dimension: 32,
            max_batch_size: 16,
        }
    }
}

impl HashEmbeddingProvider {
    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimension);
        let mut counter = 0u32;
        while out.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks(4) {
                if out.len() == self.dimension {
                    break;
                }
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.push((word as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        out
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        Ok(EmbeddingResult {
            embeddings: texts.iter().map(|t| self.vector_for(t)).collect(),
            model_used: "hash".to_string(),
            tokens_used: None,
        })
    }

    fn model_name(&self) -> &str {
        "hash"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_provider_is_deterministic() {
        let provider = HashEmbeddingProvider::default();
        let a = provider.embed_text("team sync").await.unwrap();
        let b = provider.embed_text("team sync").await.unwrap();
        let c = provider.embed_text("client call").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn hash_provider_batches_in_order() {
        let provider = HashEmbeddingProvider::default();
        let batch = provider
            .embed_texts(&["one".to_string(), "two".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.embeddings.len(), 2);
        assert_eq!(
            batch.embeddings[0],
            provider.embed_text("one").await.unwrap()
        );
    }
}
