use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::retry::IsTransient;
use crate::metrics::Metrics;

// ============================================================================
// Circuit Breaker Pattern Implementation
// ============================================================================
//
// Guards the publisher. Only transient failures count towards opening the
// circuit; caller-side outcomes such as a deadline or shutdown pass through
// without touching the state.
//
// States:
// - Closed: Normal operation, requests pass through
// - Open: Too many failures, requests rejected immediately
// - HalfOpen: Cooldown elapsed, probing whether the broker recovered
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }

    fn as_gauge(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before opening
    pub failure_threshold: u32,
    /// Time to stay open before probing
    pub timeout: Duration,
    /// Successes needed in half-open to close again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<BreakerState>>,
    config: CircuitBreakerConfig,
    metrics: Option<Arc<Metrics>>,
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            config,
            metrics,
        }
    }

    /// Run `operation` unless the circuit is open.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: IsTransient,
    {
        {
            let mut state = self.state.lock().await;
            if state.state == CircuitState::Open {
                let cooled_down = state
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.timeout);
                if !cooled_down {
                    return Err(CircuitBreakerError::CircuitOpen);
                }
                self.transition(&mut state, CircuitState::HalfOpen);
                state.success_count = 0;
            }
        }

        match operation.await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(err) => {
                if err.is_transient() {
                    self.record_failure().await;
                }
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.failure_count += 1;

        match state.state {
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                tracing::warn!(failures = state.failure_count, "Publisher circuit breaker opening");
                self.transition(&mut state, CircuitState::Open);
                state.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Failure during half-open, reopening circuit");
                self.transition(&mut state, CircuitState::Open);
                state.opened_at = Some(Instant::now());
                state.success_count = 0;
            }
            _ => {}
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        tracing::info!(from = from.as_str(), to = to.as_str(), "Circuit breaker transition");
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_breaker_transition(from.as_str(), to.as_str());
            metrics.update_circuit_breaker_state(to.as_gauge());
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Manually close the circuit.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
    }
}
