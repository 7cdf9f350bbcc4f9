// src/hypervisor/probe.rs

//! TCP/443 reachability probing used during reboot-wait phase 2 (spec §4.6e).
//!
//! A plain `connect()` with a timeout, no protocol handshake, treating
//! `timeout` and connection-refused as expected ("not up yet") rather
//! than error conditions worth logging.

use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Attempts a single TCP connect to `address:443`. Returns `true` only on a
/// successful connect; timeouts and connection-refused are normal during a
/// reboot and are reported as `false` without being logged as errors.
pub async fn is_reachable(address: IpAddr, connect_timeout: Duration) -> bool {
    match timeout(connect_timeout, TcpStream::connect((address, 443))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(%address, error = %e, "tcp/443 probe refused or failed");
            false
        }
        Err(_) => false,
    }
}

/// Probes the primary address first, then a configured fallback, widening
/// the connect timeout from 5s up to 10s as the caller's elapsed wait grows
/// (spec §4.6e reboot-wait phase 2).
pub async fn probe_with_fallback(
    primary: IpAddr,
    fallback: Option<IpAddr>,
    connect_timeout: Duration,
) -> bool {
    if is_reachable(primary, connect_timeout).await {
        return true;
    }
    if let Some(fallback) = fallback {
        return is_reachable(fallback, connect_timeout).await;
    }
    false
}

/// Widens the connect timeout linearly from 5s to 10s over the first 5
/// minutes of a reboot-wait loop, then holds at 10s, matching the original's
/// "dynamic timeout adjustment" intent without its ad hoc per-call tuning.
pub fn escalating_timeout(elapsed: Duration) -> Duration {
    const MIN: Duration = Duration::from_secs(5);
    const MAX: Duration = Duration::from_secs(10);
    const RAMP: Duration = Duration::from_secs(300);

    if elapsed >= RAMP {
        return MAX;
    }
    let frac = elapsed.as_secs_f64() / RAMP.as_secs_f64();
    MIN + Duration::from_secs_f64((MAX - MIN).as_secs_f64() * frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalating_timeout_starts_at_five_seconds() {
        assert_eq!(escalating_timeout(Duration::ZERO), Duration::from_secs(5));
    }

    #[test]
    fn escalating_timeout_caps_at_ten_seconds() {
        assert_eq!(escalating_timeout(Duration::from_secs(600)), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn unreachable_address_is_not_reachable() {
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let reachable = is_reachable(addr, Duration::from_millis(200)).await;
        assert!(!reachable);
    }
}
