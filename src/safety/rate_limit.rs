//! Per-session sliding-window rate limiting.
//!
//! Four budgets stack: a global per-minute and per-hour cap across all
//! calls, plus independent read and write budgets with a shared burst
//! allowance on top of the per-minute windows. Windows are keyed by MCP
//! session id and timed with the monotonic clock, so wall-clock jumps
//! cannot refill or starve a window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::classifier::{ErrorCategory, ErrorResponse};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Total calls per minute across reads and writes. Zero disables.
    pub rpm: u32,
    /// Total calls per hour. Zero disables.
    pub rph: u32,
    /// Read calls per minute.
    pub read_rpm: u32,
    /// Write calls per minute.
    pub write_rpm: u32,
    /// Extra calls tolerated above the per-minute budgets within a window.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rpm: 120,
            rph: 2000,
            read_rpm: 120,
            write_rpm: 30,
            burst: 10,
        }
    }
}

#[derive(Default)]
struct SessionWindows {
    reads: VecDeque<Instant>,
    writes: VecDeque<Instant>,
    all_minute: VecDeque<Instant>,
    all_hour: VecDeque<Instant>,
}

fn evict(events: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(front) = events.front() {
        if now.duration_since(*front) >= window {
            events.pop_front();
        } else {
            break;
        }
    }
}

fn seconds_until_slot(events: &VecDeque<Instant>, window: Duration, now: Instant) -> u64 {
    events
        .front()
        .map(|oldest| window.saturating_sub(now.duration_since(*oldest)).as_secs() + 1)
        .unwrap_or(1)
}

/// Sliding-window limiter, safe under concurrent tool invocations.
pub struct RateLimiter {
    config: RateLimitConfig,
    sessions: Mutex<HashMap<String, SessionWindows>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one call. Rejections carry `retry_after` in seconds.
    pub fn check(&self, session_id: &str, is_write: bool) -> Result<(), Box<ErrorResponse>> {
        if !self.config.enabled {
            return Ok(());
        }
        self.check_at(session_id, is_write, Instant::now())
    }

    fn check_at(
        &self,
        session_id: &str,
        is_write: bool,
        now: Instant,
    ) -> Result<(), Box<ErrorResponse>> {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            // A poisoned window map fails open rather than wedging all tools.
            Err(poisoned) => poisoned.into_inner(),
        };
        let windows = sessions.entry(session_id.to_string()).or_default();

        evict(&mut windows.all_minute, MINUTE, now);
        evict(&mut windows.all_hour, HOUR, now);
        if self.config.rpm > 0
            && windows.all_minute.len() >= self.config.rpm as usize + self.config.burst as usize
        {
            let retry_after = seconds_until_slot(&windows.all_minute, MINUTE, now);
            return Err(rejected("overall", self.config.rpm, self.config.burst, retry_after));
        }
        if self.config.rph > 0 && windows.all_hour.len() >= self.config.rph as usize {
            let retry_after = seconds_until_slot(&windows.all_hour, HOUR, now);
            return Err(rejected("hourly", self.config.rph, 0, retry_after));
        }

        let (events, budget) = if is_write {
            (&mut windows.writes, self.config.write_rpm)
        } else {
            (&mut windows.reads, self.config.read_rpm)
        };
        evict(events, MINUTE, now);
        if events.len() >= budget as usize + self.config.burst as usize {
            let retry_after = seconds_until_slot(events, MINUTE, now);
            let kind = if is_write { "write" } else { "read" };
            return Err(rejected(kind, budget, self.config.burst, retry_after));
        }

        events.push_back(now);
        windows.all_minute.push_back(now);
        windows.all_hour.push_back(now);
        Ok(())
    }

    /// Drop a session's windows when the client disconnects.
    pub fn forget(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(session_id);
        }
    }
}

fn rejected(kind: &str, budget: u32, burst: u32, retry_after: u64) -> Box<ErrorResponse> {
    Box::new(
        ErrorResponse::new(
            ErrorCategory::RateLimit,
            "RATE_LIMIT_EXCEEDED",
            format!("The {} call budget for this session is exhausted", kind),
            "Slow down and retry after the indicated delay.",
        )
        .with_retry_after(retry_after)
        .with_details(json!({"kind": kind, "budget": budget, "burst": burst})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(read_rpm: u32, write_rpm: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            rpm: 0,
            rph: 0,
            read_rpm,
            write_rpm,
            burst,
        })
    }

    #[test]
    fn accepts_up_to_budget_plus_burst() {
        let limiter = limiter(5, 5, 2);
        let t0 = Instant::now();
        for i in 0..7 {
            assert!(limiter.check_at("s1", false, t0).is_ok(), "call {}", i);
        }
        let err = limiter.check_at("s1", false, t0).unwrap_err();
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert!(err.retry_after.is_some());
    }

    #[test]
    fn read_and_write_budgets_are_independent() {
        let limiter = limiter(2, 2, 0);
        let t0 = Instant::now();
        assert!(limiter.check_at("s1", false, t0).is_ok());
        assert!(limiter.check_at("s1", false, t0).is_ok());
        assert!(limiter.check_at("s1", false, t0).is_err());
        // Writes still have their own window.
        assert!(limiter.check_at("s1", true, t0).is_ok());
    }

    #[test]
    fn window_slides() {
        let limiter = limiter(1, 1, 0);
        let t0 = Instant::now();
        assert!(limiter.check_at("s1", false, t0).is_ok());
        assert!(limiter.check_at("s1", false, t0).is_err());
        let later = t0 + MINUTE + Duration::from_millis(10);
        assert!(limiter.check_at("s1", false, later).is_ok());
    }

    #[test]
    fn global_minute_budget_spans_both_classes() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            rpm: 3,
            rph: 0,
            read_rpm: 100,
            write_rpm: 100,
            burst: 0,
        });
        let t0 = Instant::now();
        assert!(limiter.check_at("s1", false, t0).is_ok());
        assert!(limiter.check_at("s1", true, t0).is_ok());
        assert!(limiter.check_at("s1", false, t0).is_ok());
        let err = limiter.check_at("s1", true, t0).unwrap_err();
        assert_eq!(err.category, ErrorCategory::RateLimit);
    }

    #[test]
    fn hourly_budget_outlives_minute_windows() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            rpm: 0,
            rph: 2,
            read_rpm: 100,
            write_rpm: 100,
            burst: 0,
        });
        let t0 = Instant::now();
        assert!(limiter.check_at("s1", false, t0).is_ok());
        // Even far apart within the hour, the third call is rejected.
        let t1 = t0 + Duration::from_secs(120);
        assert!(limiter.check_at("s1", false, t1).is_ok());
        let t2 = t0 + Duration::from_secs(240);
        assert!(limiter.check_at("s1", false, t2).is_err());
    }

    #[test]
    fn sessions_are_isolated() {
        let limiter = limiter(1, 1, 0);
        let t0 = Instant::now();
        assert!(limiter.check_at("a", false, t0).is_ok());
        assert!(limiter.check_at("b", false, t0).is_ok());
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            rpm: 0,
            rph: 0,
            read_rpm: 0,
            write_rpm: 0,
            burst: 0,
        });
        for _ in 0..100 {
            assert!(limiter.check("s", true).is_ok());
        }
    }
}
