//! Health probing with hysteresis.
//!
//! The tracker is pure state: feed it probe verdicts and clock readings,
//! get back the container-health group to report when it changes. The
//! async executors below produce the verdicts (HTTP GET, TCP connect, or
//! in-container exec). Probes never kill anything; replacement is the
//! reconciler's call.

use std::time::Duration;

use tracing::trace;
use warren_types::{ContainerHealth, HealthCheck, HealthState, ProbeSpec, Timestamp};

use crate::runtime::Runtime;

// ============================================================================
// Hysteresis tracker
// ============================================================================

/// Per-container health bookkeeping.
///
/// Transitions:
/// - `Starting` until the start-period ends (failures don't count) or the
///   first success
/// - `retries` consecutive failures → `Unhealthy`
/// - `success_threshold` consecutive successes after a failure → `Healthy`
#[derive(Debug, Clone)]
pub struct HealthTracker {
    retries: u32,
    success_threshold: u32,
    start_period_ms: u64,
    started: Timestamp,
    health: ContainerHealth,
}

impl HealthTracker {
    pub fn new(check: &HealthCheck, started: Timestamp) -> Self {
        Self {
            retries: check.retries.max(1),
            success_threshold: check.success_threshold.max(1),
            start_period_ms: check.start_period_ms,
            started,
            health: ContainerHealth {
                state: HealthState::Starting,
                ..ContainerHealth::default()
            },
        }
    }

    pub fn health(&self) -> ContainerHealth {
        self.health
    }

    /// Feeds one probe verdict. Returns the new health group when the
    /// externally visible state changed (repeated identical reports are a
    /// no-op upstream, so don't bother sending them).
    pub fn observe(&mut self, passed: bool, now: Timestamp) -> Option<ContainerHealth> {
        let before = self.health.state;

        if passed {
            self.health.passing_streak += 1;
            self.health.failing_streak = 0;
            match self.health.state {
                HealthState::Starting | HealthState::Unknown => {
                    self.health.state = HealthState::Healthy;
                }
                HealthState::Unhealthy => {
                    if self.health.passing_streak >= self.success_threshold {
                        self.health.state = HealthState::Healthy;
                        self.health.unhealthy_since = None;
                    }
                }
                HealthState::Healthy => {}
            }
        } else {
            let in_grace = now.millis_since(self.started) < self.start_period_ms
                && self.health.state == HealthState::Starting;
            if in_grace {
                // Failures inside the start period don't count.
                return None;
            }
            self.health.failing_streak += 1;
            self.health.passing_streak = 0;
            if self.health.failing_streak >= self.retries
                && self.health.state != HealthState::Unhealthy
            {
                self.health.state = HealthState::Unhealthy;
                self.health.unhealthy_since = Some(now);
            }
        }

        if self.health.state == before {
            None
        } else {
            Some(self.health)
        }
    }
}

// ============================================================================
// Probe execution
// ============================================================================

/// Runs one probe attempt against a container.
pub async fn run_probe(
    probe: &ProbeSpec,
    address: Option<&str>,
    runtime: &dyn Runtime,
    handle: &str,
    timeout_ms: u64,
) -> bool {
    let timeout = Duration::from_millis(timeout_ms.max(1));
    let verdict = match probe {
        ProbeSpec::Http {
            path,
            port,
            expect_min,
            expect_max,
        } => match address {
            Some(addr) => http_probe(addr, *port, path, *expect_min, *expect_max, timeout).await,
            None => false,
        },
        ProbeSpec::Tcp { port } => match address {
            Some(addr) => tcp_probe(addr, *port, timeout).await,
            None => false,
        },
        ProbeSpec::Exec { command } => {
            match tokio::time::timeout(timeout, runtime.exec(handle, command)).await {
                Ok(Ok(code)) => code == 0,
                Ok(Err(_)) | Err(_) => false,
            }
        }
    };
    trace!(handle, passed = verdict, "probe");
    verdict
}

async fn http_probe(
    addr: &str,
    port: u16,
    path: &str,
    expect_min: u16,
    expect_max: u16,
    timeout: Duration,
) -> bool {
    let url = format!("http://{addr}:{port}{path}");
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    match client.get(&url).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            code >= expect_min && code <= expect_max
        }
        Err(_) => false,
    }
}

async fn tcp_probe(addr: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(
            timeout,
            tokio::net::TcpStream::connect((addr, port)),
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(retries: u32, successes: u32, start_period_ms: u64) -> HealthTracker {
        let check = HealthCheck {
            probe: ProbeSpec::Tcp { port: 80 },
            interval_ms: 1_000,
            timeout_ms: 500,
            retries,
            success_threshold: successes,
            start_period_ms,
        };
        HealthTracker::new(&check, Timestamp::from_millis(0))
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn needs_n_consecutive_failures_to_go_unhealthy() {
        let mut t = tracker(3, 1, 0);
        assert_eq!(t.observe(true, ts(1)).unwrap().state, HealthState::Healthy);

        assert!(t.observe(false, ts(2)).is_none());
        assert!(t.observe(false, ts(3)).is_none());
        // An interleaved success resets the streak.
        assert!(t.observe(true, ts(4)).is_none());
        assert!(t.observe(false, ts(5)).is_none());
        assert!(t.observe(false, ts(6)).is_none());
        let unhealthy = t.observe(false, ts(7)).unwrap();
        assert_eq!(unhealthy.state, HealthState::Unhealthy);
        assert_eq!(unhealthy.failing_streak, 3);
        assert_eq!(unhealthy.unhealthy_since, Some(ts(7)));
    }

    #[test]
    fn recovery_needs_m_consecutive_successes() {
        let mut t = tracker(1, 2, 0);
        t.observe(true, ts(1));
        t.observe(false, ts(2));
        assert_eq!(t.health().state, HealthState::Unhealthy);

        assert!(t.observe(true, ts(3)).is_none());
        let recovered = t.observe(true, ts(4)).unwrap();
        assert_eq!(recovered.state, HealthState::Healthy);
        assert_eq!(recovered.unhealthy_since, None);
    }

    #[test]
    fn start_period_suppresses_failures() {
        let mut t = tracker(1, 1, 10_000);
        assert!(t.observe(false, ts(1_000)).is_none());
        assert!(t.observe(false, ts(5_000)).is_none());
        assert_eq!(t.health().state, HealthState::Starting);
        assert_eq!(t.health().failing_streak, 0);

        // Past the grace, failures count.
        let unhealthy = t.observe(false, ts(11_000)).unwrap();
        assert_eq!(unhealthy.state, HealthState::Unhealthy);
    }

    #[test]
    fn success_during_start_period_ends_it() {
        let mut t = tracker(3, 1, 10_000);
        let healthy = t.observe(true, ts(500)).unwrap();
        assert_eq!(healthy.state, HealthState::Healthy);
        // From then on failures count normally even inside the window.
        t.observe(false, ts(600));
        t.observe(false, ts(700));
        let unhealthy = t.observe(false, ts(800)).unwrap();
        assert_eq!(unhealthy.state, HealthState::Unhealthy);
    }
}
