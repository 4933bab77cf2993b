//! Background re-connect loop for the push channel.
//!
//! The connection manager never retries on its own. This task listens for
//! lost or failed links and calls `connect()` again after a jittered,
//! exponentially growing delay, as long as some consumer still wants a room.

use super::connection::{ConnectionManager, ConnectionStatus, SyncEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Give up after this many consecutive credential rejections.
const MAX_AUTH_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// `base * 2^(failures-1)`, capped, plus up to 50% jitter.
pub fn backoff_delay(policy: &ReconnectPolicy, failures: u32, rng: &mut impl Rng) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = policy
        .base_delay
        .saturating_mul(1u32 << exp)
        .min(policy.max_delay);
    let jitter_ms = delay.as_millis() as u64 / 2;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rng.gen_range(0..=jitter_ms)
    };
    delay + Duration::from_millis(jitter)
}

fn is_auth_failure(message: &str) -> bool {
    message.contains("401") || message.contains("Unauthorized")
}

/// Spawn the supervisor. Abort the handle to stop it.
pub fn spawn_reconnector(manager: ConnectionManager, policy: ReconnectPolicy) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = manager.subscribe();
        let mut rng = StdRng::from_entropy();
        let mut auth_failures = 0u32;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "reconnector lagged");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            match event {
                SyncEvent::Connected => auth_failures = 0,
                SyncEvent::ConnectionError(message) if is_auth_failure(&message) => {
                    auth_failures += 1;
                    if auth_failures >= MAX_AUTH_FAILURES {
                        tracing::error!(
                            "{} consecutive push channel auth failures, giving up on reconnects",
                            auth_failures
                        );
                        return;
                    }
                    retry(&manager, &policy, &mut rng).await;
                }
                SyncEvent::ConnectionError(_) | SyncEvent::ConnectionLost(_) => {
                    retry(&manager, &policy, &mut rng).await;
                }
                SyncEvent::Push(_) => {}
            }
        }
    })
}

async fn retry(manager: &ConnectionManager, policy: &ReconnectPolicy, rng: &mut StdRng) {
    let failures = manager.state().consecutive_failures.max(1);
    let delay = backoff_delay(policy, failures, rng);
    tracing::info!(
        delay_ms = delay.as_millis() as u64,
        failures,
        "push channel reconnecting"
    );
    tokio::time::sleep(delay).await;

    // An explicit disconnect() in the meantime clears the pending room.
    let state = manager.state();
    if state.status == ConnectionStatus::Disconnected && state.pending_room.is_some() {
        manager.connect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };
        let mut rng = StdRng::seed_from_u64(7);
        for (failures, base) in [(1, 2), (2, 4), (3, 8), (4, 10), (30, 10)] {
            let d = backoff_delay(&policy, failures, &mut rng);
            let base = Duration::from_secs(base);
            assert!(d >= base && d <= base + base / 2, "failures={} delay={:?}", failures, d);
        }
    }

    #[test]
    fn test_zero_base_has_no_jitter() {
        let policy = ReconnectPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff_delay(&policy, 5, &mut rng), Duration::ZERO);
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(is_auth_failure("push channel rejected credentials (401 Unauthorized)"));
        assert!(!is_auth_failure("connection refused"));
    }
}
