//! Completion polling with bounded back-off.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// First sleep after a busy probe.
    pub initial_backoff: Duration,
    /// Upper bound on a single sleep.
    pub max_backoff: Duration,
    /// Floor applied to chip-reported timeouts. A USB round trip alone can
    /// exceed the typical word-program time advertised in CFI.
    pub min_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(100),
            min_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Done,
    Backoff(Duration),
    Expired,
}

/// Tracks one wait-for-completion loop. Feed it the result of each probe;
/// it answers whether to stop, sleep, or give up.
#[derive(Debug)]
pub struct Poller {
    policy: PollPolicy,
    started: Instant,
    timeout: Duration,
    backoff: Duration,
    probes: u32,
}

impl Poller {
    pub fn new(policy: PollPolicy, timeout: Duration) -> Self {
        Self {
            policy,
            started: Instant::now(),
            timeout: timeout.max(policy.min_timeout),
            backoff: policy.initial_backoff,
            probes: 0,
        }
    }

    pub fn next(&mut self, busy: bool) -> PollStep {
        self.probes = self.probes.saturating_add(1);
        if !busy {
            return PollStep::Done;
        }

        let elapsed = self.started.elapsed();
        if elapsed >= self.timeout {
            return PollStep::Expired;
        }

        let sleep = self.backoff.min(self.timeout - elapsed);
        self.backoff = (self.backoff * 2).min(self.policy.max_backoff);
        PollStep::Backoff(sleep)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn probes(&self) -> u32 {
        self.probes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_policy() -> PollPolicy {
        PollPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            min_timeout: Duration::ZERO,
        }
    }

    #[test]
    fn idle_probe_is_done() {
        let mut p = Poller::new(instant_policy(), Duration::from_secs(1));
        assert_eq!(p.next(false), PollStep::Done);
        assert_eq!(p.probes(), 1);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut p = Poller::new(instant_policy(), Duration::from_secs(60));
        assert_eq!(p.next(true), PollStep::Backoff(Duration::from_millis(1)));
        assert_eq!(p.next(true), PollStep::Backoff(Duration::from_millis(2)));
        assert_eq!(p.next(true), PollStep::Backoff(Duration::from_millis(4)));
        assert_eq!(p.next(true), PollStep::Backoff(Duration::from_millis(4)));
    }

    #[test]
    fn zero_timeout_expires_on_first_busy_probe() {
        let mut p = Poller::new(instant_policy(), Duration::ZERO);
        assert_eq!(p.next(true), PollStep::Expired);
    }

    #[test]
    fn timeout_is_floored() {
        let policy = PollPolicy {
            min_timeout: Duration::from_millis(50),
            ..instant_policy()
        };
        let p = Poller::new(policy, Duration::from_micros(64));
        assert_eq!(p.timeout(), Duration::from_millis(50));
    }
}
