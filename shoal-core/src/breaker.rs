use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use crate::config::CircuitBreakerConfig;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// A rolling window failure-rate gate applied per endpoint.
///
/// Completions are counted over a rolling window. Once enough samples are
/// in and the failure ratio reaches the configured threshold the breaker
/// opens and rejects requests. After the sleep window a single canary is
/// let through, its outcome decides between closing again and re-opening.
///
/// A disabled breaker does no bookkeeping and reports permanently closed.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    epoch: Instant,
    state: AtomicU8,
    total: AtomicU64,
    failed: AtomicU64,
    window_start_nanos: AtomicU64,
    opened_at_nanos: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            state: AtomicU8::new(STATE_CLOSED),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            window_start_nanos: AtomicU64::new(0),
            opened_at_nanos: AtomicU64::new(0),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Called on dispatch. Ages out the rolling window when it expired.
    pub fn track(&self) {
        if !self.config.enabled {
            return;
        }

        let now = self.now_nanos();
        let window_start = self.window_start_nanos.load(Ordering::Relaxed);
        let window = self.config.rolling_window.as_nanos() as u64;
        if now.saturating_sub(window_start) > window
            && self
                .window_start_nanos
                .compare_exchange(window_start, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.total.store(0, Ordering::Relaxed);
            self.failed.store(0, Ordering::Relaxed);
        }
    }

    pub fn mark_success(&self) {
        if !self.config.enabled {
            return;
        }

        // A successful canary closes the circuit again.
        if self
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.reset_counters();
            return;
        }

        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_failure(&self) {
        if !self.config.enabled {
            return;
        }

        // A failed canary re-opens with a fresh sleep window.
        if self
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.opened_at_nanos.store(self.now_nanos(), Ordering::Relaxed);
            return;
        }

        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        let failed = self.failed.fetch_add(1, Ordering::Relaxed) + 1;

        let volume_reached = total >= self.config.volume_threshold;
        let ratio_reached =
            failed * 100 >= total * u64::from(self.config.error_threshold_percentage);
        if volume_reached
            && ratio_reached
            && self
                .state
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.opened_at_nanos.store(self.now_nanos(), Ordering::Relaxed);
        }
    }

    /// Whether the endpoint may take another request right now.
    ///
    /// An open breaker whose sleep window elapsed grants exactly one canary
    /// to the first caller asking, everyone else keeps getting rejected
    /// until the canary's outcome is known.
    pub fn allows_request(&self) -> bool {
        if !self.config.enabled {
            return true;
        }

        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => true,
            STATE_OPEN => {
                let opened_at = self.opened_at_nanos.load(Ordering::Relaxed);
                let slept = self.now_nanos().saturating_sub(opened_at);
                slept >= self.config.sleep_window.as_nanos() as u64
                    && self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
            },
            _ => false,
        }
    }

    /// Drops all tracked state and closes the circuit, used after a fresh
    /// connect.
    pub fn reset(&self) {
        if !self.config.enabled {
            return;
        }
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.reset_counters();
    }

    pub fn state(&self) -> BreakerState {
        if !self.config.enabled {
            return BreakerState::Closed;
        }
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => BreakerState::Closed,
            STATE_OPEN => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    fn reset_counters(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.window_start_nanos.store(self.now_nanos(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tight_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            volume_threshold: 4,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_millis(20),
            rolling_window: Duration::from_secs(60),
        }
    }

    fn fail_until_open(breaker: &CircuitBreaker) {
        for _ in 0..4 {
            breaker.track();
            breaker.mark_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_stays_closed_below_volume_threshold() {
        let breaker = CircuitBreaker::new(tight_config());
        for _ in 0..3 {
            breaker.track();
            breaker.mark_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allows_request());
    }

    #[test]
    fn test_opens_once_ratio_and_volume_are_reached() {
        let breaker = CircuitBreaker::new(tight_config());
        breaker.track();
        breaker.mark_success();
        breaker.track();
        breaker.mark_success();
        breaker.track();
        breaker.mark_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // Fourth sample tips the ratio to exactly 50%.
        breaker.track();
        breaker.mark_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allows_request());
    }

    #[test]
    fn test_single_canary_after_sleep_window() {
        let breaker = CircuitBreaker::new(tight_config());
        fail_until_open(&breaker);

        assert!(!breaker.allows_request());
        std::thread::sleep(Duration::from_millis(25));

        // Exactly one canary is granted.
        assert!(breaker.allows_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allows_request());

        breaker.mark_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allows_request());
    }

    #[test]
    fn test_failed_canary_reopens_with_fresh_window() {
        let breaker = CircuitBreaker::new(tight_config());
        fail_until_open(&breaker);

        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.allows_request());

        breaker.mark_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // The sleep window restarted, no immediate second canary.
        assert!(!breaker.allows_request());
    }

    #[test]
    fn test_reset_closes_and_clears() {
        let breaker = CircuitBreaker::new(tight_config());
        fail_until_open(&breaker);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allows_request());
    }

    #[test]
    fn test_disabled_breaker_is_permanently_closed() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            volume_threshold: 1,
            error_threshold_percentage: 1,
            sleep_window: Duration::from_millis(1),
            rolling_window: Duration::from_secs(1),
        });

        for _ in 0..64 {
            breaker.track();
            breaker.mark_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allows_request());
    }

    #[test]
    fn test_rolling_window_ages_out_samples() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            rolling_window: Duration::from_millis(10),
            ..tight_config()
        });

        for _ in 0..3 {
            breaker.track();
            breaker.mark_failure();
        }
        std::thread::sleep(Duration::from_millis(15));

        // The stale samples are dropped, one more failure is not enough to
        // trip the breaker on its own.
        breaker.track();
        breaker.mark_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
