//! Cache-aware embedding with request grouping, retry and pacing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, error};

use super::cache::EmbeddingCache;
use super::embedding::EmbeddingProvider;
use crate::error::EmbeddingError;
use crate::models::EmbeddingConfig;
use crate::utils::retry::{RetryConfig, RetryResult, with_retry};

/// Enforces a minimum gap between outbound requests, across all workers.
#[derive(Debug)]
pub struct RequestPacer {
    min_gap: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last: Mutex::new(None),
        }
    }

    /// Wait until a request may be sent, then claim the slot.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_gap {
                sleep(self.min_gap - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Result of embedding a list of texts.
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    /// One slot per input text; `None` where no vector could be produced.
    pub vectors: Vec<Option<Vec<f32>>>,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// Set when the provider gave up and later texts were left unembedded.
    pub error: Option<String>,
}

impl EmbedOutcome {
    pub fn embedded(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.vectors.iter().all(Option::is_some)
    }
}

pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    pacer: RequestPacer,
    retry: RetryConfig,
    request_batch_size: usize,
}

impl CachedEmbedder {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            pacer: RequestPacer::new(Duration::from_millis(config.request_delay_ms)),
            retry: config.retry_config(),
            request_batch_size: config.request_batch_size.max(1) as usize,
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Embed `texts` in request groups, serving cache hits locally and
    /// sending only misses to the provider.
    ///
    /// Never fails: once a group exhausts its retries, embedding stops and
    /// the vectors produced so far are returned.
    pub async fn embed(&self, texts: &[String]) -> EmbedOutcome {
        let mut outcome = EmbedOutcome {
            vectors: vec![None; texts.len()],
            ..Default::default()
        };

        for (group_idx, group) in texts.chunks(self.request_batch_size).enumerate() {
            let offset = group_idx * self.request_batch_size;

            let mut misses = Vec::new();
            let mut miss_slots = Vec::new();
            for (j, text) in group.iter().enumerate() {
                let fingerprint = EmbeddingCache::fingerprint(text);
                match self.cache.get(&fingerprint) {
                    Some(vector) => {
                        outcome.vectors[offset + j] = Some(vector);
                        outcome.cache_hits += 1;
                    }
                    None => {
                        misses.push(text.clone());
                        miss_slots.push((offset + j, fingerprint));
                        outcome.cache_misses += 1;
                    }
                }
            }

            if misses.is_empty() {
                continue;
            }

            match self.request(&misses).await {
                RetryResult::Success(vectors) => {
                    for ((slot, fingerprint), vector) in miss_slots.into_iter().zip(vectors) {
                        self.cache.put(fingerprint, vector.clone());
                        outcome.vectors[slot] = Some(vector);
                    }
                    debug!(
                        "Embedded {} texts (cache hits so far: {}, misses: {})",
                        misses.len(),
                        outcome.cache_hits,
                        outcome.cache_misses
                    );
                }
                RetryResult::Failed {
                    last_error,
                    attempts,
                } => {
                    error!(
                        "Embedding failed after {} attempts: {}; keeping {} of {} vectors",
                        attempts,
                        last_error,
                        outcome.embedded(),
                        texts.len()
                    );
                    outcome.error = Some(last_error.to_string());
                    break;
                }
            }
        }

        outcome
    }

    /// Embed a search query without touching the cache.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, EmbeddingError> {
        let provider = &self.provider;
        let pacer = &self.pacer;
        with_retry(&self.retry, || async move {
            pacer.wait().await;
            provider.embed_query(query).await
        })
        .await
        .into_result()
    }

    async fn request(&self, texts: &[String]) -> RetryResult<Vec<Vec<f32>>, EmbeddingError> {
        let provider = &self.provider;
        let pacer = &self.pacer;
        with_retry(&self.retry, || async move {
            pacer.wait().await;
            let vectors = provider.embed(texts).await?;
            if vectors.len() != texts.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                )));
            }
            Ok(vectors)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds each text as `[len, first byte]`; fails every call after
    /// `ok_texts` texts have been served.
    struct ScriptedProvider {
        calls: AtomicUsize,
        served: AtomicUsize,
        ok_texts: usize,
    }

    impl ScriptedProvider {
        fn new(ok_texts: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                served: AtomicUsize::new(0),
                ok_texts,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let served = self.served.load(Ordering::SeqCst);
            if served + texts.len() > self.ok_texts {
                return Err(EmbeddingError::RateLimited("quota exceeded".to_string()));
            }
            self.served.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, t.as_bytes()[0] as f32])
                .collect())
        }
    }

    fn config(group: u32) -> EmbeddingConfig {
        EmbeddingConfig {
            request_batch_size: group,
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            request_delay_ms: 0,
            ..Default::default()
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text number {i}")).collect()
    }

    #[tokio::test]
    async fn test_embeds_all_and_caches() {
        let provider = Arc::new(ScriptedProvider::new(usize::MAX));
        let cache = Arc::new(EmbeddingCache::new(100));
        let embedder = CachedEmbedder::new(provider.clone(), cache.clone(), &config(4));

        let outcome = embedder.embed(&texts(10)).await;
        assert!(outcome.is_complete());
        assert!(outcome.error.is_none());
        assert_eq!(outcome.cache_misses, 10);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.size(), 10);

        let again = embedder.embed(&texts(10)).await;
        assert_eq!(again.cache_hits, 10);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(again.vectors, outcome.vectors);
    }

    #[tokio::test]
    async fn test_identical_text_shares_vector() {
        let provider = Arc::new(ScriptedProvider::new(usize::MAX));
        let cache = Arc::new(EmbeddingCache::new(100));
        let embedder = CachedEmbedder::new(provider, cache.clone(), &config(1));

        let input = vec!["same".to_string(), "other".to_string(), "same".to_string()];
        let outcome = embedder.embed(&input).await;
        assert_eq!(outcome.cache_hits, 1);
        assert_eq!(outcome.vectors[0], outcome.vectors[2]);
        assert_eq!(cache.size(), 2);
    }

    #[tokio::test]
    async fn test_partial_results_on_exhaustion() {
        let provider = Arc::new(ScriptedProvider::new(3));
        let cache = Arc::new(EmbeddingCache::new(100));
        let embedder = CachedEmbedder::new(provider.clone(), cache, &config(1));

        let outcome = embedder.embed(&texts(5)).await;
        assert_eq!(outcome.embedded(), 3);
        assert!(outcome.vectors[..3].iter().all(Option::is_some));
        assert!(outcome.vectors[3..].iter().all(Option::is_none));
        assert!(outcome.error.is_some());
        // three successful calls, then the fourth group retried twice
        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_pacer_spaces_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(20));
        let start = Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
