use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::cache::QueryCache;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::query::{first_candidate, GeocodeResult};

// Returns the raw response body for an assembled query string.
#[async_trait]
pub trait GeocodeTransport: Send + Sync {
    async fn search(&self, query: &str) -> AppResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    Cache,
    Network,
}

#[derive(Debug, Clone)]
pub struct Lookup {
    pub result: Option<GeocodeResult>,
    pub source: LookupSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub lookups: u64,
    pub cache_hits: u64,
    pub network_requests: u64,
}

pub struct QueryClient {
    cache: QueryCache,
    transport: Arc<dyn GeocodeTransport>,
    rate_limiter: Arc<RateLimiter>,
    // Total requests per query, the first one included.
    empty_result_attempts: u32,
    lookups: AtomicU64,
    cache_hits: AtomicU64,
    network_requests: AtomicU64,
}

impl QueryClient {
    pub fn new(
        cache: QueryCache,
        transport: Arc<dyn GeocodeTransport>,
        rate_limiter: Arc<RateLimiter>,
        empty_result_attempts: u32,
    ) -> Self {
        Self {
            cache,
            transport,
            rate_limiter,
            empty_result_attempts: empty_result_attempts.max(1),
            lookups: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            network_requests: AtomicU64::new(0),
        }
    }

    pub async fn fetch(&self, query: &str) -> AppResult<Lookup> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(payload) = self.cache.get(query)? {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(query, "query cache hit");
            return Ok(Lookup {
                result: first_candidate(&payload),
                source: LookupSource::Cache,
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.wait().await;
            self.network_requests.fetch_add(1, Ordering::Relaxed);
            let payload = self.transport.search(query).await?;
            let result = first_candidate(&payload);
            if result.is_some() || attempt >= self.empty_result_attempts {
                self.cache.put(query, &payload)?;
                return Ok(Lookup {
                    result,
                    source: LookupSource::Network,
                });
            }
            debug!(query, attempt, "geocoder returned no candidates; retrying");
        }
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            network_requests: self.network_requests.load(Ordering::Relaxed),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }
}

/// Keeps a fixed gap between consecutive outgoing requests. One limiter is
/// shared by every client of a run, so the gap also holds across countries.
pub struct RateLimiter {
    interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

pub struct HttpGeocoder {
    http: reqwest::Client,
    endpoint: Url,
    api_key: Option<SecretString>,
}

impl HttpGeocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let endpoint = Url::parse(&config.geocoder_endpoint).map_err(|err| {
            AppError::Config(format!(
                "invalid geocoder endpoint {:?}: {err}",
                config.geocoder_endpoint
            ))
        })?;
        let http = reqwest::Client::builder()
            .user_agent(config.geocoder_user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|err| AppError::Config(format!("unable to build http client: {err}")))?;
        Ok(Self {
            http,
            endpoint,
            api_key: config.geocoder_api_key.clone(),
        })
    }

    fn request_url(&self, query: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.set_query(Some(query));
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key.expose_secret());
        }
        url
    }
}

#[async_trait]
impl GeocodeTransport for HttpGeocoder {
    async fn search(&self, query: &str) -> AppResult<String> {
        let response = self
            .http
            .get(self.request_url(query))
            .send()
            .await
            .map_err(|err| AppError::Transport(err.without_url().to_string()))?;

        let status = response.status();
        if matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS) {
            warn!(status = status.as_u16(), "geocoder is throttling requests");
            return Err(AppError::RateLimited {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(AppError::Transport(format!(
                "geocoder answered with HTTP {status}"
            )));
        }

        response
            .text()
            .await
            .map_err(|err| AppError::Transport(err.without_url().to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    pub enum Reply {
        Payload(String),
        RateLimited,
        Unreachable,
    }

    impl Reply {
        pub fn empty() -> Self {
            Reply::Payload("[]".into())
        }

        pub fn hit(lat: &str, lon: &str) -> Self {
            Reply::Payload(format!(r#"[{{"lat":"{lat}","lon":"{lon}"}}]"#))
        }
    }

    pub struct ScriptedTransport {
        script: Box<dyn Fn(&str) -> Reply + Send + Sync>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn new(script: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn always_empty() -> Arc<Self> {
            Self::new(|_| Reply::empty())
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl GeocodeTransport for ScriptedTransport {
        async fn search(&self, query: &str) -> AppResult<String> {
            self.calls.lock().push(query.to_string());
            match (self.script)(query) {
                Reply::Payload(payload) => Ok(payload),
                Reply::RateLimited => Err(AppError::RateLimited { status: 403 }),
                Reply::Unreachable => Err(AppError::Transport("connection refused".into())),
            }
        }
    }
}
