use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::PoolError;
use crate::metrics::{ErrorType, MetricsCollector};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff step, capped at `max_retry_delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier)
                .min(self.max_retry_delay.as_secs_f64()),
        )
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Arc<Mutex<CircuitBreakerState>>,
}

#[derive(Debug, Clone)]
enum CircuitBreakerState {
    Closed { failure_count: u32 },
    Open { opened_at: Instant },
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            state: Arc::new(Mutex::new(CircuitBreakerState::Closed { failure_count: 0 })),
        }
    }

    pub fn can_execute(&self) -> bool {
        if let Ok(mut state) = self.state.lock() {
            match &*state {
                CircuitBreakerState::Closed { .. } | CircuitBreakerState::HalfOpen => true,
                CircuitBreakerState::Open { opened_at } => {
                    if opened_at.elapsed() >= self.recovery_timeout {
                        *state = CircuitBreakerState::HalfOpen;
                        true
                    } else {
                        false
                    }
                }
            }
        } else {
            false
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = CircuitBreakerState::Closed { failure_count: 0 };
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut state) = self.state.lock() {
            match &mut *state {
                CircuitBreakerState::Closed { failure_count } => {
                    *failure_count += 1;
                    if *failure_count >= self.failure_threshold {
                        *state = CircuitBreakerState::Open { opened_at: Instant::now() };
                    }
                }
                CircuitBreakerState::Open { .. } => {}
                CircuitBreakerState::HalfOpen => {
                    *state = CircuitBreakerState::Open { opened_at: Instant::now() };
                }
            }
        }
    }

    pub fn get_state(&self) -> String {
        if let Ok(state) = self.state.lock() {
            match &*state {
                CircuitBreakerState::Closed { failure_count } => {
                    format!("closed (failures: {})", failure_count)
                }
                CircuitBreakerState::Open { opened_at } => {
                    format!("open (elapsed: {:?})", opened_at.elapsed())
                }
                CircuitBreakerState::HalfOpen => "half-open".to_string(),
            }
        } else {
            "unknown".to_string()
        }
    }
}

/// Retries upstream calls with backoff behind a circuit breaker.
pub struct ErrorHandler {
    retry_config: RetryConfig,
    circuit_breaker: CircuitBreaker,
    metrics: Arc<MetricsCollector>,
}

impl ErrorHandler {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            retry_config: RetryConfig::default(),
            circuit_breaker: CircuitBreaker::new(5, Duration::from_secs(60)),
            metrics,
        }
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_circuit_breaker(mut self, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        self.circuit_breaker = CircuitBreaker::new(failure_threshold, recovery_timeout);
        self
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T, PoolError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        if !self.circuit_breaker.can_execute() {
            return Err(PoolError::Rpc(format!(
                "circuit breaker is open: {}",
                self.circuit_breaker.get_state()
            )));
        }

        let mut delay = self.retry_config.retry_delay;
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => {
                    self.circuit_breaker.record_success();
                    self.metrics.record_rpc_success();
                    return Ok(result);
                }
                Err(error) => {
                    self.metrics.record_error(ErrorType::Rpc);
                    if attempt >= self.retry_config.max_retries {
                        self.circuit_breaker.record_failure();
                        return Err(error);
                    }
                    tracing::debug!(attempt, error = %error, "upstream call failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = self.retry_config.next_delay(delay);
                    attempt += 1;
                }
            }
        }
    }

    pub fn get_circuit_breaker_status(&self) -> String {
        self.circuit_breaker.get_state()
    }
}

// Token bucket guarding share submission over the status server.
pub struct RateLimiter {
    tokens: Mutex<(f64, Instant)>,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    pub fn new(max_tokens: u32, refill_rate: f64) -> Self {
        Self {
            tokens: Mutex::new((max_tokens as f64, Instant::now())),
            max_tokens: max_tokens as f64,
            refill_rate,
        }
    }

    pub fn try_acquire(&self) -> bool {
        if let Ok(mut guard) = self.tokens.lock() {
            let (tokens, last_refill) = &mut *guard;
            let now = Instant::now();
            let elapsed = now.duration_since(*last_refill).as_secs_f64();
            *tokens = (*tokens + elapsed * self.refill_rate).min(self.max_tokens);
            *last_refill = now;

            if *tokens >= 1.0 {
                *tokens -= 1.0;
                true
            } else {
                false
            }
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            retry_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_is_capped() {
        let cfg = fast_retry(3);
        assert_eq!(cfg.next_delay(Duration::from_millis(1)), Duration::from_millis(2));
        assert_eq!(cfg.next_delay(Duration::from_millis(3)), Duration::from_millis(4));
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert!(!breaker.can_execute());
        breaker.record_success();
        assert!(breaker.can_execute());
    }

    #[tokio::test]
    async fn retries_until_success() {
        let metrics = Arc::new(MetricsCollector::new());
        let handler = ErrorHandler::new(metrics.clone()).with_retry_config(fast_retry(3));
        let calls = AtomicU32::new(0);

        let result = handler
            .execute_with_retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PoolError::Rpc("down".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(metrics.get_metrics().rpc_errors, 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let handler =
            ErrorHandler::new(Arc::new(MetricsCollector::new())).with_retry_config(fast_retry(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = handler
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PoolError::Rpc("down".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_breaker_skips_the_call() {
        let handler = ErrorHandler::new(Arc::new(MetricsCollector::new()))
            .with_retry_config(fast_retry(0))
            .with_circuit_breaker(1, Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            let result: Result<(), _> = handler
                .execute_with_retry(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(PoolError::Rpc("down".into())) }
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handler.get_circuit_breaker_status().starts_with("open"));
    }

    #[test]
    fn rate_limiter_drains() {
        let limiter = RateLimiter::new(2, 0.0);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
