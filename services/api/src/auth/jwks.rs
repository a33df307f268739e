//! Cached signing keys for the configured identity provider.
//!
//! # Purpose
//! Resolves the JWKS endpoint (explicit URL or OIDC discovery), fetches the
//! key set and keeps it for a TTL so token validation does no network I/O on
//! the hot path.
//!
//! # Key invariants
//! - A fresh key set is served from memory without contacting the provider.
//! - When a refresh fails, the last key set fetched successfully keeps being
//!   served while its age is below `ttl + stale_grace`. Validation only fails
//!   when no usable key set exists at all.
//! - Forced refreshes (unknown `kid`) are rate limited so a flood of tokens
//!   with random key ids cannot turn into a flood of provider requests.
//! - A failed fetch starts a backoff of `MIN_FORCED_REFRESH_INTERVAL`. During
//!   the backoff the stale set is served without contacting the provider.
//!
//! # Concurrency model
//! Caches are `DashMap`s keyed by URL. Each URL has its own refresh mutex, so
//! concurrent misses produce one upstream request. While a refresh is in
//! flight, callers holding a usable stale set return it instead of waiting.
use crate::observability::JWKS_REFRESH_TOTAL;
use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Minimum spacing between forced refreshes of the same key set. Also the
/// backoff after a failed fetch.
pub const MIN_FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signing keys unavailable: {0}")]
    Unavailable(String),
}

/// Where the key set comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// `{issuer}/.well-known/openid-configuration` names the JWKS URL.
    Discovery { issuer: String },
    Url(String),
}

#[derive(Debug, Clone)]
struct CachedJwks {
    jwks: Arc<JwkSet>,
    fetched_at: Instant,
}

#[derive(Debug, Clone)]
struct CachedDiscovery {
    jwks_url: String,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Debug, Clone)]
pub struct JwksCache {
    client: reqwest::Client,
    source: KeySource,
    jwks_cache: Arc<DashMap<String, CachedJwks>>,
    discovery_cache: Arc<DashMap<String, CachedDiscovery>>,
    // Last failed fetch per URL (JWKS and discovery alike).
    failures: Arc<DashMap<String, Instant>>,
    refresh_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    ttl: Duration,
    stale_grace: Duration,
}

impl JwksCache {
    pub fn new(source: KeySource, ttl: Duration, stale_grace: Duration) -> Result<Self, JwksError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self::with_client(client, source, ttl, stale_grace))
    }

    pub fn with_client(
        client: reqwest::Client,
        source: KeySource,
        ttl: Duration,
        stale_grace: Duration,
    ) -> Self {
        Self {
            client,
            source,
            jwks_cache: Arc::new(DashMap::new()),
            discovery_cache: Arc::new(DashMap::new()),
            failures: Arc::new(DashMap::new()),
            refresh_locks: Arc::new(DashMap::new()),
            ttl,
            stale_grace,
        }
    }

    /// Current key set, refreshing it when the cached copy expired.
    pub async fn keys(&self) -> Result<Arc<JwkSet>, JwksError> {
        let jwks_url = self.jwks_url().await?;
        if let Some(jwks) = self.cached_within(&jwks_url, self.ttl) {
            return Ok(jwks);
        }
        if self.recently_failed(&jwks_url)
            && let Some(jwks) = self.usable_stale(&jwks_url)
        {
            metrics::counter!(JWKS_REFRESH_TOTAL, "result" => "stale").increment(1);
            return Ok(jwks);
        }
        self.refresh(&jwks_url, self.ttl).await
    }

    /// Refetch after a `kid` miss.
    ///
    /// Returns `None` when the cached copy is too recent to justify another
    /// request, or the provider failed moments ago; the caller then treats
    /// the key as unknown.
    pub async fn force_refresh(&self) -> Result<Option<Arc<JwkSet>>, JwksError> {
        let jwks_url = self.jwks_url().await?;
        if self
            .cached_within(&jwks_url, MIN_FORCED_REFRESH_INTERVAL)
            .is_some()
            || self.recently_failed(&jwks_url)
        {
            return Ok(None);
        }
        self.refresh(&jwks_url, MIN_FORCED_REFRESH_INTERVAL)
            .await
            .map(Some)
    }

    fn cached_within(&self, jwks_url: &str, max_age: Duration) -> Option<Arc<JwkSet>> {
        self.jwks_cache
            .get(jwks_url)
            .filter(|entry| entry.fetched_at.elapsed() < max_age)
            .map(|entry| entry.jwks.clone())
    }

    fn usable_stale(&self, jwks_url: &str) -> Option<Arc<JwkSet>> {
        self.cached_within(jwks_url, self.ttl + self.stale_grace)
    }

    fn recently_failed(&self, url: &str) -> bool {
        self.failures
            .get(url)
            .is_some_and(|failed_at| failed_at.elapsed() < MIN_FORCED_REFRESH_INTERVAL)
    }

    fn refresh_lock(&self, url: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Single-flight refetch. `fresh_for` is how young a cached set must be
    /// for a caller that waited on the lock to take it instead of fetching.
    async fn refresh(&self, jwks_url: &str, fresh_for: Duration) -> Result<Arc<JwkSet>, JwksError> {
        let lock = self.refresh_lock(jwks_url);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if let Some(jwks) = self.usable_stale(jwks_url) {
                    metrics::counter!(JWKS_REFRESH_TOTAL, "result" => "stale").increment(1);
                    return Ok(jwks);
                }
                lock.lock().await
            }
        };

        // Whoever held the lock may have settled the question already.
        if let Some(jwks) = self.cached_within(jwks_url, fresh_for) {
            return Ok(jwks);
        }
        if self.recently_failed(jwks_url) {
            return self.usable_stale(jwks_url).ok_or_else(|| {
                JwksError::Unavailable("refresh backing off after a failed fetch".to_string())
            });
        }

        match self.fetch_jwks(jwks_url).await {
            Ok(jwks) => {
                metrics::counter!(JWKS_REFRESH_TOTAL, "result" => "ok").increment(1);
                let jwks = Arc::new(jwks);
                self.jwks_cache.insert(
                    jwks_url.to_string(),
                    CachedJwks {
                        jwks: jwks.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                self.failures.remove(jwks_url);
                Ok(jwks)
            }
            Err(err) => {
                self.failures.insert(jwks_url.to_string(), Instant::now());
                if let Some(jwks) = self.usable_stale(jwks_url) {
                    metrics::counter!(JWKS_REFRESH_TOTAL, "result" => "stale").increment(1);
                    tracing::warn!(
                        error = %err,
                        retry_in_secs = MIN_FORCED_REFRESH_INTERVAL.as_secs(),
                        "jwks refresh failed; serving last known good keys"
                    );
                    return Ok(jwks);
                }
                metrics::counter!(JWKS_REFRESH_TOTAL, "result" => "error").increment(1);
                tracing::error!(error = %err, "jwks refresh failed and no usable keys are cached");
                Err(JwksError::Unavailable(err.to_string()))
            }
        }
    }

    async fn fetch_jwks(&self, jwks_url: &str) -> Result<JwkSet, reqwest::Error> {
        self.client
            .get(jwks_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn fetch_discovery(&self, url: &str) -> Result<DiscoveryDocument, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    fn cached_discovery(&self, discovery_url: &str, max_age: Option<Duration>) -> Option<String> {
        self.discovery_cache
            .get(discovery_url)
            .filter(|entry| max_age.is_none_or(|max_age| entry.fetched_at.elapsed() < max_age))
            .map(|entry| entry.jwks_url.clone())
    }

    async fn jwks_url(&self) -> Result<String, JwksError> {
        let issuer = match &self.source {
            KeySource::Url(url) => return Ok(url.clone()),
            KeySource::Discovery { issuer } => issuer,
        };
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );

        if let Some(jwks_url) = self.cached_discovery(&discovery_url, Some(self.ttl)) {
            return Ok(jwks_url);
        }
        // The JWKS location rarely moves; an old answer beats waiting on a
        // provider that just failed or is being asked already.
        if self.recently_failed(&discovery_url)
            && let Some(jwks_url) = self.cached_discovery(&discovery_url, None)
        {
            return Ok(jwks_url);
        }

        let lock = self.refresh_lock(&discovery_url);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if let Some(jwks_url) = self.cached_discovery(&discovery_url, None) {
                    return Ok(jwks_url);
                }
                lock.lock().await
            }
        };
        if let Some(jwks_url) = self.cached_discovery(&discovery_url, Some(self.ttl)) {
            return Ok(jwks_url);
        }
        if self.recently_failed(&discovery_url) {
            return self.cached_discovery(&discovery_url, None).ok_or_else(|| {
                JwksError::Unavailable("discovery backing off after a failed fetch".to_string())
            });
        }

        match self.fetch_discovery(&discovery_url).await {
            Ok(doc) => {
                self.failures.remove(&discovery_url);
                self.discovery_cache.insert(
                    discovery_url,
                    CachedDiscovery {
                        jwks_url: doc.jwks_uri.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(doc.jwks_uri)
            }
            Err(err) => {
                self.failures.insert(discovery_url.clone(), Instant::now());
                if let Some(jwks_url) = self.cached_discovery(&discovery_url, None) {
                    tracing::warn!(error = %err, "oidc discovery failed; reusing cached jwks url");
                    return Ok(jwks_url);
                }
                Err(JwksError::Unavailable(format!("discovery failed: {err}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Provider {
        hits: Arc<AtomicUsize>,
        attempts: Arc<AtomicUsize>,
        down: Arc<AtomicBool>,
    }

    async fn spawn_provider(jwks: serde_json::Value, provider: Provider) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let discovery = json!({ "jwks_uri": format!("http://{addr}/jwks") });
        let app = axum::Router::new()
            .route(
                "/.well-known/openid-configuration",
                axum::routing::get(move || {
                    let discovery = discovery.clone();
                    async move { axum::Json(discovery) }
                }),
            )
            .route(
                "/jwks",
                axum::routing::get(move || {
                    let jwks = jwks.clone();
                    let provider = provider.clone();
                    async move {
                        provider.attempts.fetch_add(1, Ordering::SeqCst);
                        if provider.down.load(Ordering::SeqCst) {
                            return Err(StatusCode::SERVICE_UNAVAILABLE);
                        }
                        provider.hits.fetch_add(1, Ordering::SeqCst);
                        Ok(axum::Json(jwks))
                    }
                }),
            );
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        addr
    }

    fn cache_for(source: KeySource, ttl: Duration, stale_grace: Duration) -> JwksCache {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("client");
        JwksCache::with_client(client, source, ttl, stale_grace)
    }

    fn sample_jwks() -> serde_json::Value {
        json!({
            "keys": [{
                "kty": "RSA",
                "kid": "kid-1",
                "alg": "RS256",
                "use": "sig",
                "n": "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDprecbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBIY2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw",
                "e": "AQAB"
            }]
        })
    }

    #[tokio::test]
    async fn discovery_then_cached_keys() {
        let provider = Provider::default();
        let addr = spawn_provider(sample_jwks(), provider.clone()).await;
        let cache = cache_for(
            KeySource::Discovery {
                issuer: format!("http://{addr}/"),
            },
            Duration::from_secs(300),
            Duration::from_secs(3600),
        );

        let first = cache.keys().await.expect("keys");
        let second = cache.keys().await.expect("keys");
        assert_eq!(first.keys.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forced_refresh_is_rate_limited() {
        let provider = Provider::default();
        let addr = spawn_provider(sample_jwks(), provider.clone()).await;
        let cache = cache_for(
            KeySource::Url(format!("http://{addr}/jwks")),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        );

        cache.keys().await.expect("keys");
        assert!(cache.force_refresh().await.expect("refresh").is_none());
        assert_eq!(provider.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outage_serves_last_known_good_then_fails_after_grace() {
        let provider = Provider::default();
        let addr = spawn_provider(sample_jwks(), provider.clone()).await;
        let cache = cache_for(
            KeySource::Url(format!("http://{addr}/jwks")),
            Duration::from_millis(20),
            Duration::from_millis(300),
        );

        cache.keys().await.expect("initial keys");
        provider.down.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let stale = cache.keys().await.expect("stale keys");
        assert_eq!(stale.keys.len(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let err = cache.keys().await.unwrap_err();
        assert!(matches!(err, JwksError::Unavailable(_)));
    }

    #[tokio::test]
    async fn outage_backs_off_instead_of_refetching_per_call() {
        let provider = Provider::default();
        let addr = spawn_provider(sample_jwks(), provider.clone()).await;
        let cache = cache_for(
            KeySource::Url(format!("http://{addr}/jwks")),
            Duration::from_millis(20),
            Duration::from_secs(60),
        );

        cache.keys().await.expect("initial keys");
        provider.down.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let before = provider.attempts.load(Ordering::SeqCst);

        for _ in 0..50 {
            let keys = cache.keys().await.expect("stale keys");
            assert_eq!(keys.keys.len(), 1);
        }
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.keys().await }));
        }
        for task in tasks {
            task.await.expect("join").expect("stale keys");
        }
        assert!(cache.force_refresh().await.expect("refresh").is_none());

        assert_eq!(provider.attempts.load(Ordering::SeqCst) - before, 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let provider = Provider::default();
        let addr = spawn_provider(sample_jwks(), provider.clone()).await;
        let cache = cache_for(
            KeySource::Discovery {
                issuer: format!("http://{addr}"),
            },
            Duration::from_secs(300),
            Duration::from_secs(3600),
        );

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.keys().await }));
        }
        for task in tasks {
            task.await.expect("join").expect("keys");
        }
        assert_eq!(provider.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_provider_without_cache_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let cache = cache_for(
            KeySource::Url(format!("http://{addr}/jwks")),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        );
        assert!(matches!(
            cache.keys().await,
            Err(JwksError::Unavailable(_))
        ));
    }
}
