// src/throttler/mod.rs

//! Per-host request serialization, global concurrency cap, circuit breaker
//! and retry with backoff for BMC HTTP calls (spec §4.1).
//!
//! A `DashMap<IpAddr, Arc<Mutex<()>>>` keeps per-host serialization cheap:
//! hosts with no in-flight request never contend on anyone else's lock.

use crate::config::ThrottlerConfig;
use crate::error::{EngineError, Result};
use crate::metrics;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use reqwest::Method;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Per-host circuit-breaker bookkeeping (spec §3 "Circuit-breaker state").
#[derive(Debug, Default)]
struct HostState {
    consecutive_failures: AtomicU32,
    /// Epoch-millis deadline; `0` means the circuit is closed.
    open_until_millis: AtomicU64,
    last_request_completed_at: SyncMutex<Option<Instant>>,
}

/// Options passed to an individual throttled request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub body: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
    pub basic_auth: Option<(String, String)>,
}

pub struct ThrottledResponse {
    pub status: u16,
    pub body: bytes_compat::Body,
}

/// A minimal local substitute for `bytes::Bytes` so the throttler doesn't
/// need to depend on the `bytes` crate just to move a response body around.
pub mod bytes_compat {
    #[derive(Debug, Clone, Default)]
    pub struct Body(pub Vec<u8>);

    impl Body {
        pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
            String::from_utf8_lossy(&self.0)
        }
    }
}

/// Ensures no BMC is subjected to concurrent requests from this process, caps
/// global outbound concurrency, and isolates unhealthy BMCs (spec §4.1).
pub struct Throttler {
    client: reqwest::Client,
    hosts: DashMap<IpAddr, Arc<HostState>>,
    locks: DashMap<IpAddr, Arc<Mutex<()>>>,
    semaphore: SyncMutex<Arc<Semaphore>>,
    settings: SyncMutex<ThrottlerConfig>,
}

impl Throttler {
    pub fn new(config: ThrottlerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            client: reqwest::Client::new(),
            hosts: DashMap::new(),
            locks: DashMap::new(),
            semaphore: SyncMutex::new(semaphore),
            settings: SyncMutex::new(config),
        }
    }

    fn host_state(&self, host: IpAddr) -> Arc<HostState> {
        self.hosts
            .entry(host)
            .or_insert_with(|| Arc::new(HostState::default()))
            .clone()
    }

    fn host_lock(&self, host: IpAddr) -> Arc<Mutex<()>> {
        self.locks
            .entry(host)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomically swaps the concurrency cap and the minimum per-host delay.
    /// In-flight calls are unaffected; after a brief transient window no more
    /// than the new cap may be in flight (spec §4.1 `update_settings`).
    pub fn update_settings(&self, max_concurrent: usize, request_delay_ms: u64) {
        let mut settings = self.settings.lock();
        settings.max_concurrent = max_concurrent;
        settings.request_delay_ms = request_delay_ms;
        *self.semaphore.lock() = Arc::new(Semaphore::new(max_concurrent));
        info!(max_concurrent, request_delay_ms, "throttler settings updated");
    }

    fn is_circuit_open(&self, state: &HostState) -> Option<u64> {
        let open_until = state.open_until_millis.load(Ordering::SeqCst);
        if open_until == 0 {
            return None;
        }
        let now = now_millis();
        if now < open_until {
            Some((open_until - now) / 1000)
        } else {
            state.open_until_millis.store(0, Ordering::SeqCst);
            state.consecutive_failures.store(0, Ordering::SeqCst);
            None
        }
    }

    /// Records a successful call: resets the failure count and closes the circuit.
    pub fn record_success(&self, host: IpAddr) {
        let state = self.host_state(host);
        state.consecutive_failures.store(0, Ordering::SeqCst);
        state.open_until_millis.store(0, Ordering::SeqCst);
    }

    /// Records a failed call. Opens the circuit once `circuit_threshold`
    /// consecutive failures have accumulated. `status` is informational only
    /// (401/403 are tracked the same as any other ≥400 response or transport
    /// failure, per spec §4.1 step 6).
    pub fn record_failure(&self, host: IpAddr, status: Option<u16>) {
        let state = self.host_state(host);
        let threshold = self.settings.lock().circuit_threshold;
        let failures = state.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(status, Some(401) | Some(403)) {
            warn!(%host, status, failures, "authentication failure recorded against BMC");
        }
        if failures >= threshold {
            let timeout = self.settings.lock().circuit_timeout;
            let open_until = now_millis() + timeout.as_millis() as u64;
            state.open_until_millis.store(open_until, Ordering::SeqCst);
            metrics::CIRCUIT_OPENS_TOTAL.inc();
            warn!(%host, failures, timeout_secs = timeout.as_secs(), "circuit breaker opened");
        }
    }

    async fn enforce_rate_limit(&self, host: IpAddr, state: &HostState) {
        let delay_ms = self.settings.lock().request_delay_ms;
        let last = *state.last_request_completed_at.lock();
        if let Some(last) = last {
            let elapsed = last.elapsed();
            let min_delay = Duration::from_millis(delay_ms);
            if elapsed < min_delay {
                let remaining = min_delay - elapsed;
                debug!(%host, sleep_ms = remaining.as_millis(), "throttler rate-limit sleep");
                sleep(remaining).await;
            }
        }
    }

    /// Performs a throttled HTTP request against a single BMC host, per the
    /// six-step contract in spec §4.1.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        host: IpAddr,
        opts: RequestOptions,
    ) -> Result<(ThrottledResponse, u64)> {
        let state = self.host_state(host);

        // Step 1: fail fast if the circuit is open, without acquiring any lock.
        if let Some(retry_in) = self.is_circuit_open(&state) {
            return Err(EngineError::CircuitOpen {
                host: host.to_string(),
                retry_in_seconds: retry_in,
            });
        }

        // Step 2: acquire the per-host lock, serializing same-host calls.
        let lock = self.host_lock(host);
        let _guard = lock.lock().await;

        // Step 3: enforce the minimum inter-request spacing for this host.
        self.enforce_rate_limit(host, &state).await;

        // Step 4: acquire a slot on the global concurrency semaphore.
        let semaphore = self.semaphore.lock().clone();
        let _permit = semaphore.acquire_owned().await.map_err(|_| {
            EngineError::Internal("throttler semaphore closed unexpectedly".into())
        })?;

        let timeout = opts.timeout.unwrap_or(Duration::from_secs(30));
        let result = self
            .attempt_with_retries(&method, url, host, &opts, timeout)
            .await;

        *state.last_request_completed_at.lock() = Some(Instant::now());

        match &result {
            Ok((resp, _)) => {
                if resp.status < 400 {
                    self.record_success(host);
                } else {
                    self.record_failure(host, Some(resp.status));
                }
            }
            Err(EngineError::Timeout(_)) | Err(EngineError::HttpClientError(_)) => {
                self.record_failure(host, None);
            }
            _ => {}
        }

        result
    }

    async fn attempt_with_retries(
        &self,
        method: &Method,
        url: &str,
        host: IpAddr,
        opts: &RequestOptions,
        timeout: Duration,
    ) -> Result<(ThrottledResponse, u64)> {
        const MAX_ATTEMPTS: u32 = 3;

        for attempt in 0..MAX_ATTEMPTS {
            let start = Instant::now();
            let mut builder = self.client.request(method.clone(), url).timeout(timeout);
            if let Some(body) = &opts.body {
                builder = builder.json(body);
            }
            if let Some((user, pass)) = &opts.basic_auth {
                builder = builder.basic_auth(user, Some(pass));
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    let bytes = response.bytes().await.unwrap_or_default();
                    // Step 5 contract: never retry on an HTTP status, even ≥400 — return it.
                    return Ok((
                        ThrottledResponse {
                            status,
                            body: bytes_compat::Body(bytes.to_vec()),
                        },
                        elapsed_ms,
                    ));
                }
                Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                    let is_timeout = e.is_timeout();
                    metrics::THROTTLER_RETRIES_TOTAL.inc();
                    let backoff = exponential_backoff(attempt);
                    warn!(
                        %host, attempt, is_timeout, error = %e,
                        backoff_secs = backoff.as_secs_f64(),
                        "transient BMC request failure, retrying after backoff"
                    );
                    sleep(backoff).await;
                }
                Err(e) if e.is_timeout() => return Err(EngineError::Timeout(timeout)),
                Err(e) => return Err(EngineError::from(e)),
            }
        }
        unreachable!("loop always returns by the final attempt")
    }

    /// A lightweight GET with a short timeout that never retries aggressively;
    /// used by pre-flight connectivity probes only (spec §4.1 `ping`).
    pub async fn ping(&self, host: IpAddr, url: &str) -> Result<bool> {
        let state = self.host_state(host);
        if self.is_circuit_open(&state).is_some() {
            return Ok(false);
        }
        let lock = self.host_lock(host);
        let _guard = lock.lock().await;
        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if (resp.status().as_u16()) < 400 => {
                self.record_success(host);
                Ok(true)
            }
            Ok(resp) => {
                self.record_failure(host, Some(resp.status().as_u16()));
                Ok(false)
            }
            Err(_) => {
                self.record_failure(host, None);
                Ok(false)
            }
        }
    }
}

/// `min(2^attempt, 60) + uniform(0, 0.3 * 2^attempt)` seconds, per spec §4.1 step 5.
fn exponential_backoff(attempt: u32) -> Duration {
    let base = 2f64.powi(attempt as i32).min(60.0);
    let jitter = rand::thread_rng().gen_range(0.0..(0.3 * 2f64.powi(attempt as i32)));
    Duration::from_secs_f64(base + jitter)
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config() -> ThrottlerConfig {
        ThrottlerConfig {
            max_concurrent: 4,
            request_delay_ms: 0,
            circuit_threshold: 3,
            circuit_timeout: Duration::from_secs(1800),
        }
    }

    #[test]
    fn backoff_is_capped_at_sixty_seconds_base() {
        let d = exponential_backoff(10);
        assert!(d.as_secs_f64() < 60.0 + 0.3 * 60.0 + 1.0);
    }

    #[tokio::test]
    async fn circuit_opens_exactly_at_threshold() {
        let throttler = Throttler::new(test_config());
        let host = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        throttler.record_failure(host, Some(500));
        assert!(throttler.is_circuit_open(&throttler.host_state(host)).is_none());

        throttler.record_failure(host, Some(500));
        assert!(throttler.is_circuit_open(&throttler.host_state(host)).is_none());

        throttler.record_failure(host, Some(500));
        assert!(throttler.is_circuit_open(&throttler.host_state(host)).is_some());
    }

    #[test]
    fn record_success_resets_and_closes_circuit() {
        let throttler = Throttler::new(test_config());
        let host = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        throttler.record_failure(host, Some(500));
        throttler.record_failure(host, Some(500));
        throttler.record_failure(host, Some(500));
        assert!(throttler.is_circuit_open(&throttler.host_state(host)).is_some());

        throttler.record_success(host);
        assert!(throttler.is_circuit_open(&throttler.host_state(host)).is_none());
        assert_eq!(
            throttler
                .host_state(host)
                .consecutive_failures
                .load(Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn update_settings_swaps_cap_without_rejecting_in_flight() {
        let throttler = Throttler::new(test_config());
        let permit = throttler.semaphore.lock().clone().acquire_owned().await.unwrap();
        throttler.update_settings(8, 0);
        assert_eq!(throttler.settings.lock().max_concurrent, 8);
        drop(permit);
    }
}
