use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Consecutive-failure circuit breaker shared by the vector-store and LLM
/// gateways (C8/C9). Unlike a per-call async guard, state lives behind a
/// plain `std::sync::Mutex`: the critical section is a handful of field
/// reads, never an await point.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_after: Duration,
    state: Mutex<State>,
}

struct State {
    open: bool,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        Self {
            failure_threshold,
            reset_after,
            state: Mutex::new(State { open: false, consecutive_failures: 0, opened_at: None }),
        }
    }

    /// True if a call may proceed. An open circuit past `reset_after`
    /// transitions to half-open by letting exactly one probe call through;
    /// its outcome decides whether the circuit re-closes or re-opens.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.open {
            return true;
        }
        match state.opened_at {
            Some(opened_at) if opened_at.elapsed() >= self.reset_after => {
                state.open = false;
                true
            }
            _ => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.open = false;
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.open = true;
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());
        assert!(breaker.is_open());
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.allow());
    }

    #[test]
    fn reopens_after_failed_half_open_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());
    }
}
