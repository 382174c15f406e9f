//! Bounded exponential backoff with jitter for transient runtime errors.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff: base doubles per attempt, capped, with ±25%
/// jitter so a fleet of workers doesn't hammer a recovering daemon in
/// lockstep.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base_ms,
            cap_ms,
            attempt: 0,
        }
    }

    /// Next delay; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base_ms.saturating_mul(1 << self.attempt.min(16));
        let capped = exp.min(self.cap_ms);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_span = capped / 4;
        let jittered = if jitter_span == 0 {
            capped
        } else {
            let delta = rand::thread_rng().gen_range(0..=jitter_span * 2);
            capped - jitter_span + delta
        };
        Duration::from_millis(jittered)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_respects_the_cap() {
        let mut backoff = Backoff::new(100, 2_000);
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(2_500), "{delay:?}");
            last = delay;
        }
        // Deep into the schedule we sit at the (jittered) cap.
        assert!(last >= Duration::from_millis(1_500), "{last:?}");
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(100, 2_000);
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(150));
    }
}
