//! Embedding gateway and backends.
//!
//! [`EmbeddingGateway`] is the only path from chunk text to vectors. It
//! splits input into batches of `batch_size`, sends each batch to an
//! [`EmbeddingBackend`], retries the whole batch on retryable failures
//! according to an explicit [`RetryPolicy`], and validates the shape of
//! every response.
//!
//! Backends make exactly one attempt per call and classify their own
//! failures:
//! - HTTP 429 (rate limited) and 5xx (server error) → retryable
//! - HTTP 4xx (client error, not 429) → fatal
//! - Timeouts and connection errors → retryable
//! - Malformed response payloads → fatal
//!
//! The gateway adds its own per-batch timeout (retryable) and rejects
//! responses whose vector count or dimensionality is wrong (fatal).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::config::EmbeddingConfig;
use crate::error::SyncError;

/// A text → vector model. One call is one attempt.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Fixed vector dimensionality.
    fn dims(&self) -> usize;
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError>;
}

/// Retry schedule for one batch (also reused for index writes).
///
/// The n-th retry waits `base_delay_ms * 2^n`, capped at `max_delay_ms`.
/// `max_retries = 0` means a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.backoff_base_ms,
            max_delay_ms: config.backoff_max_ms,
        }
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms.max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .take(self.max_retries as usize)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// schedule is exhausted.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        let attempt = AtomicU32::new(0);
        RetryIf::spawn(
            self.delays(),
            || {
                let n = attempt.fetch_add(1, Ordering::Relaxed) + 1;
                if n > 1 {
                    tracing::debug!(what, attempt = n, "retrying");
                }
                op()
            },
            |e: &SyncError| {
                let retry = e.is_retryable();
                if retry {
                    tracing::warn!(what, error = %e, "transient failure");
                }
                retry
            },
        )
        .await
    }
}

pub struct EmbeddingGateway {
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
    policy: RetryPolicy,
    timeout: Duration,
}

impl EmbeddingGateway {
    pub fn new(
        backend: Arc<dyn EmbeddingBackend>,
        batch_size: usize,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
            policy,
            timeout,
        }
    }

    /// Gateway for the configured provider, or `None` when embedding is disabled.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Option<Self>> {
        let Some(backend) = create_backend(config)? else {
            return Ok(None);
        };
        Ok(Some(Self::new(
            backend,
            config.batch_size,
            RetryPolicy::from_config(config),
            Duration::from_secs(config.timeout_secs),
        )))
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Embed `texts` in order, `batch_size` at a time.
    ///
    /// Fails on the first batch that exhausts its retries or fails fatally;
    /// the caller treats the whole document as not embedded.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_one(batch).await?);
        }
        Ok(vectors)
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, SyncError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::embedding_fatal("empty embedding response"))
    }

    async fn embed_one(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        let vectors = self
            .policy
            .run("embedding batch", move || async move {
                match tokio::time::timeout(self.timeout, self.backend.embed(batch)).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::embedding_retryable(format!(
                        "batch of {} timed out after {:?}",
                        batch.len(),
                        self.timeout
                    ))),
                }
            })
            .await?;

        if vectors.len() != batch.len() {
            return Err(SyncError::embedding_fatal(format!(
                "backend returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        let dims = self.backend.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(SyncError::embedding_fatal(format!(
                "dimension mismatch: expected {}, got {}",
                dims,
                bad.len()
            )));
        }
        Ok(vectors)
    }
}

/// Backend for the configured provider; `None` for `"disabled"`.
pub fn create_backend(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingBackend>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAIBackend::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaBackend::new(config)?))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Some(Arc::new(LocalBackend::new(config)?))),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// Classify an HTTP status: 429 and 5xx can be retried.
fn status_error(provider: &str, status: reqwest::StatusCode, body: String) -> SyncError {
    let message = format!("{} API error {}: {}", provider, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        SyncError::embedding_retryable(message)
    } else {
        SyncError::embedding_fatal(message)
    }
}

fn transport_error(provider: &str, e: reqwest::Error) -> SyncError {
    let message = format!("{} request failed: {}", provider, e);
    if e.is_timeout() || e.is_connect() || e.is_request() {
        SyncError::embedding_retryable(message)
    } else {
        SyncError::embedding_fatal(message)
    }
}

fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

// ============ OpenAI ============

/// `POST {url}/embeddings` with `OPENAI_API_KEY`.
pub struct OpenAIBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAIBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("OpenAI", e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(status_error("OpenAI", status, body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error("OpenAI", e))?;
        parse_openai_response(&json)
    }
}

/// `data[].embedding`, reordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, SyncError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| SyncError::embedding_fatal("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vector = item
            .get("embedding")
            .and_then(parse_vector)
            .ok_or_else(|| SyncError::embedding_fatal("Invalid OpenAI response: bad embedding"))?;
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// `POST {url}/api/embed` on a local Ollama instance.
pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Ollama", e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(status_error("Ollama", status, body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error("Ollama", e))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, SyncError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            SyncError::embedding_fatal("Invalid Ollama response: missing embeddings array")
        })?;

    embeddings
        .iter()
        .map(|e| {
            parse_vector(e).ok_or_else(|| {
                SyncError::embedding_fatal("Invalid Ollama response: embedding is not an array")
            })
        })
        .collect()
}

// ============ Local (fastembed) ============

/// In-process inference via fastembed. The model is loaded on first use.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalBackend {
    model_name: String,
    model: fastembed::EmbeddingModel,
    dims: usize,
    batch_size: usize,
    loaded: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (model, default_dims) = match model_name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "bge-large-en-v1.5" => (fastembed::EmbeddingModel::BGELargeENV15, 1024),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            "multilingual-e5-small" => (fastembed::EmbeddingModel::MultilingualE5Small, 384),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 nomic-embed-text-v1.5, multilingual-e5-small",
                other
            ),
        };
        Ok(Self {
            model_name,
            model,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size,
            loaded: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingBackend for LocalBackend {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        let texts = texts.to_vec();
        let loaded = Arc::clone(&self.loaded);
        let model = self.model.clone();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .map_err(|_| SyncError::embedding_fatal("local model lock poisoned"))?;
            if guard.is_none() {
                let init = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| {
                    SyncError::embedding_fatal(format!(
                        "Failed to initialize local embedding model: {}",
                        e
                    ))
                })?;
                *guard = Some(init);
            }
            let embedder = guard
                .as_mut()
                .ok_or_else(|| SyncError::embedding_fatal("local model not loaded"))?;
            embedder
                .embed(texts, Some(batch_size))
                .map_err(|e| SyncError::embedding_fatal(format!("Local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| SyncError::embedding_fatal(format!("embedding task panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted failures, then embeds each text as `[len, 1.0]`.
    struct ScriptedBackend {
        dims: usize,
        script: Mutex<VecDeque<SyncError>>,
        calls: AtomicU32,
        delay: Option<Duration>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<SyncError>) -> Self {
            Self {
                dims: 2,
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for ScriptedBackend {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.script.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn gateway(backend: Arc<ScriptedBackend>, batch_size: usize, retries: u32) -> EmbeddingGateway {
        EmbeddingGateway::new(backend, batch_size, fast_policy(retries), Duration::from_secs(5))
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[tokio::test]
    async fn batches_preserve_order() {
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let gw = gateway(Arc::clone(&backend), 3, 0);
        let vectors = gw.embed_batch(&texts(7)).await.unwrap();
        let lens: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
        assert_eq!(lens, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            SyncError::embedding_retryable("429"),
            SyncError::embedding_retryable("503"),
        ]));
        let gw = gateway(Arc::clone(&backend), 32, 3);
        let vectors = gw.embed_batch(&texts(4)).await.unwrap();
        assert_eq!(vectors.len(), 4);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let backend = Arc::new(ScriptedBackend::new(
            (0..10).map(|_| SyncError::embedding_retryable("503")).collect(),
        ));
        let gw = gateway(Arc::clone(&backend), 32, 3);
        let err = gw.embed_batch(&texts(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingRetryable);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![SyncError::embedding_fatal("400")]));
        let gw = gateway(Arc::clone(&backend), 32, 3);
        let err = gw.embed_batch(&texts(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingFatal);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_fatal() {
        let mut backend = ScriptedBackend::new(vec![]);
        backend.dims = 3;
        let backend = Arc::new(backend);
        let gw = gateway(Arc::clone(&backend), 32, 3);
        let err = gw.embed_batch(&texts(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingFatal);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_timeout_is_retryable() {
        let mut backend = ScriptedBackend::new(vec![]);
        backend.delay = Some(Duration::from_millis(200));
        let backend = Arc::new(backend);
        let gw = EmbeddingGateway::new(
            Arc::clone(&backend) as Arc<dyn EmbeddingBackend>,
            32,
            fast_policy(1),
            Duration::from_millis(10),
        );
        let err = gw.embed_batch(&texts(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingRetryable);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn delays_follow_policy() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        let delays: Vec<u128> = policy.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![200, 400, 800, 1_000, 1_000]);
        assert_eq!(RetryPolicy { max_retries: 0, ..policy }.delays().count(), 0);
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn malformed_payloads_are_fatal() {
        let err = parse_ollama_response(&serde_json::json!({"nope": []})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingFatal);
        let err = parse_openai_response(&serde_json::json!({"data": [{"embedding": "x"}]})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingFatal);
    }

    #[test]
    fn disabled_provider_has_no_gateway() {
        let config = EmbeddingConfig::default();
        assert!(EmbeddingGateway::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn status_classification() {
        let e = status_error("OpenAI", reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(e.is_retryable());
        let e = status_error("OpenAI", reqwest::StatusCode::BAD_GATEWAY, String::new());
        assert!(e.is_retryable());
        let e = status_error("OpenAI", reqwest::StatusCode::BAD_REQUEST, String::new());
        assert!(!e.is_retryable());
    }
}
