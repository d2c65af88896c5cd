//! HTTP fetch abstraction for tile requests.
//!
//! The engine talks to the network exclusively through [`TileFetch`], which
//! allows dependency injection and easier testing by enabling mock fetchers.
//! [`ReqwestFetcher`] is the real implementation: a pooled async client with
//! a per-attempt timeout composed against the run's cancellation token.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Default User-Agent string for HTTP requests.
/// Some tile servers reject requests without one.
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Outcome of one fetch attempt, before retry classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Transport-level failure (DNS, connect, reset, ...).
    #[error("network error: {0}")]
    Network(String),

    /// The per-attempt wall clock elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status.
    #[error("HTTP status {0}")]
    Status(u16),

    /// The response body is not an image.
    #[error("response is not an image (content-type `{0}`)")]
    NotAnImage(String),

    /// The run's cancellation signal fired.
    #[error("request cancelled")]
    Cancelled,

    /// Anything the other variants don't cover.
    #[error("{0}")]
    Other(String),
}

/// Async HTTP seam for tile downloads.
///
/// One call is one attempt: retries live above this trait. Implementations
/// must honor `cancel` promptly and bound the attempt by `timeout`.
pub trait TileFetch: Send + Sync {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        cancel: &'a CancellationToken,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, FetchError>> + Send + 'a>>;
}

/// Checks that a Content-Type header names an image payload.
fn ensure_image_content_type(content_type: &str) -> Result<(), FetchError> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    if essence.to_ascii_lowercase().starts_with("image/") {
        Ok(())
    } else {
        Err(FetchError::NotAnImage(essence.to_string()))
    }
}

/// Maps a reqwest failure onto the fetch taxonomy.
fn classify_reqwest_error(err: &reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout(timeout);
    }
    if err.is_connect() || err.is_request() || err.is_body() {
        return FetchError::Network(err.to_string());
    }
    FetchError::Other(err.to_string())
}

/// Real tile fetcher backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Creates a fetcher tuned for parallel small-image downloads: warm
    /// connection pool, keepalive, no client-level timeout (attempts carry
    /// their own).
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| FetchError::Other(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<Bytes, FetchError> {
        trace!(url = url, "tile GET starting");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = url, status = status.as_u16(), "tile GET error status");
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        ensure_image_content_type(&content_type)?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e, timeout))?;
        trace!(url = url, bytes = bytes.len(), "tile GET complete");
        Ok(bytes)
    }
}

impl TileFetch for ReqwestFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        cancel: &'a CancellationToken,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
                attempt = tokio::time::timeout(timeout, self.get(url, timeout)) => {
                    match attempt {
                        Ok(result) => result,
                        Err(_elapsed) => Err(FetchError::Timeout(timeout)),
                    }
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Scriptable fetcher for tests.
    ///
    /// Responses are popped per URL in order; once a URL's script is
    /// exhausted (or absent) the default response answers. Start instants
    /// and concurrency are recorded so tests can assert pacing invariants.
    pub struct MockTileFetch {
        script: Mutex<HashMap<String, Vec<Result<Bytes, FetchError>>>>,
        default: Result<Bytes, FetchError>,
        delay: Duration,
        starts: Mutex<Vec<(Instant, String)>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl MockTileFetch {
        pub fn ok() -> Self {
            Self::with_default(Ok(Bytes::from_static(b"\x89PNG")))
        }

        pub fn with_default(default: Result<Bytes, FetchError>) -> Self {
            Self {
                script: Mutex::new(HashMap::new()),
                default,
                delay: Duration::ZERO,
                starts: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Scripts responses for one URL, consumed in order.
        pub fn script_url(&self, url: &str, responses: Vec<Result<Bytes, FetchError>>) {
            // Stored reversed so pop() yields them in submission order.
            let mut reversed = responses;
            reversed.reverse();
            self.script.lock().unwrap().insert(url.to_string(), reversed);
        }

        pub fn request_count(&self) -> usize {
            self.starts.lock().unwrap().len()
        }

        pub fn start_instants(&self) -> Vec<Instant> {
            self.starts.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }

        pub fn requested_urls(&self) -> Vec<String> {
            self.starts.lock().unwrap().iter().map(|(_, u)| u.clone()).collect()
        }

        pub fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::Relaxed)
        }

        fn next_response(&self, url: &str) -> Result<Bytes, FetchError> {
            let mut script = self.script.lock().unwrap();
            if let Some(responses) = script.get_mut(url) {
                if let Some(response) = responses.pop() {
                    return response;
                }
            }
            self.default.clone()
        }
    }

    impl TileFetch for MockTileFetch {
        fn fetch<'a>(
            &'a self,
            url: &'a str,
            cancel: &'a CancellationToken,
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Bytes, FetchError>> + Send + 'a>> {
            Box::pin(async move {
                if cancel.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }
                self.starts
                    .lock()
                    .unwrap()
                    .push((Instant::now(), url.to_string()));

                let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
                self.peak_in_flight.fetch_max(current, Ordering::Relaxed);

                if !self.delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            self.in_flight.fetch_sub(1, Ordering::Relaxed);
                            return Err(FetchError::Cancelled);
                        }
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                }

                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                self.next_response(url)
            })
        }
    }
}
