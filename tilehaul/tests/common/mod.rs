//! Shared test support: a scriptable fetcher injected through the
//! engine's `TileFetch` seam.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tilehaul::{FetchError, TileFetch};
use tokio_util::sync::CancellationToken;

/// Deterministic stub fetcher.
///
/// Responses are scripted per URL and consumed in order; unscripted URLs
/// (and exhausted scripts) answer with the default response. Request start
/// instants and peak concurrency are recorded for invariant assertions.
pub struct ScriptedFetcher {
    script: Mutex<HashMap<String, Vec<Result<Bytes, FetchError>>>>,
    default: Result<Bytes, FetchError>,
    delay: Duration,
    starts: Mutex<Vec<(Instant, String)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    /// Every request succeeds with a one-byte payload.
    pub fn ok() -> Self {
        Self::with_default(Ok(Bytes::from_static(b"\x89")))
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

    /// Adds a fixed latency to every request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Scripts responses for one URL, served in the given order.
    pub fn script_url(&self, url: &str, responses: Vec<Result<Bytes, FetchError>>) {
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
        self.starts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, url)| url.clone())
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Clears the peak counter (useful to measure only the download phase,
    /// after size estimation has already run).
    pub fn reset_peak(&self) {
        self.peak_in_flight.store(0, Ordering::Relaxed);
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

impl TileFetch for ScriptedFetcher {
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
