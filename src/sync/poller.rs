//! Decides when to re-fetch authoritative state over REST.
//!
//! The poller itself does no I/O; facades call `begin` on every sample tick
//! and run the fetch when it returns a reason.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Upper bound on staleness, even when connected and idle.
    pub safety_net: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, safety_net_factor: u32) -> Self {
        Self {
            interval,
            safety_net: interval * safety_net_factor.max(1),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollReason {
    Initial,
    SafetyNet,
    /// Push channel is down.
    Degraded,
    /// Connected, but a run is still in progress.
    Active,
    /// Explicit refresh.
    Forced,
}

impl PollReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::SafetyNet => "safety-net",
            Self::Degraded => "degraded",
            Self::Active => "active",
            Self::Forced => "forced",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FallbackPoller {
    policy: PollPolicy,
    last_refresh: Option<Instant>,
    /// Set by a failed poll, cleared by the next success.
    last_failure: Option<Instant>,
    in_flight: bool,
}

impl FallbackPoller {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            last_refresh: None,
            last_failure: None,
            in_flight: false,
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.last_refresh
    }

    /// Whether a poll is due, without claiming it.
    pub fn decide(&self, now: Instant, connected: bool, any_active: bool) -> Option<PollReason> {
        if self.in_flight {
            return None;
        }
        // After a failure, wait a full interval before the next attempt.
        if let Some(failed) = self.last_failure {
            if now.saturating_duration_since(failed) < self.policy.interval {
                return None;
            }
        }
        let Some(last) = self.last_refresh else {
            return Some(PollReason::Initial);
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.policy.safety_net {
            Some(PollReason::SafetyNet)
        } else if elapsed < self.policy.interval {
            None
        } else if !connected {
            Some(PollReason::Degraded)
        } else if any_active {
            Some(PollReason::Active)
        } else {
            None
        }
    }

    /// Claim a poll if one is due. The caller must report back via `finish`.
    pub fn begin(&mut self, now: Instant, connected: bool, any_active: bool) -> Option<PollReason> {
        let reason = self.decide(now, connected, any_active)?;
        self.in_flight = true;
        Some(reason)
    }

    /// Claim a poll regardless of timing. Still skipped while one runs.
    pub fn begin_forced(&mut self) -> Option<PollReason> {
        if self.in_flight {
            return None;
        }
        self.in_flight = true;
        Some(PollReason::Forced)
    }

    /// Only a successful poll moves `last_refresh`. A failed one is retried
    /// one interval later.
    pub fn finish(&mut self, now: Instant, ok: bool) {
        self.in_flight = false;
        if ok {
            self.last_refresh = Some(now);
            self.last_failure = None;
        } else {
            self.last_failure = Some(now);
        }
    }

    /// Forget the in-flight claim, e.g. after aborting the fetch.
    pub fn cancel(&mut self) {
        self.in_flight = false;
    }
}
