//! Per-dependency failure isolation.
//!
//! A breaker counts consecutive failures while closed, fails fast while open,
//! and lets a single probe through once the recovery timeout has elapsed.

use chrono::{DateTime, Utc};
use overseer_core::{OverseerError, OverseerResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for a single breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before probing.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Successful probes needed to close a half-open breaker.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    2
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn validate(&self) -> OverseerResult<()> {
        if self.failure_threshold == 0 {
            return Err(OverseerError::Config(
                "circuit breaker failure_threshold must be positive".into(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(OverseerError::Config(
                "circuit breaker success_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time copy of a breaker's state for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub config: CircuitBreakerConfig,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    total_calls: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn open(&mut self, name: &str) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_utc = Some(Utc::now());
        self.success_count = 0;
        self.probe_in_flight = false;
        warn!(breaker = %name, failures = self.failure_count, "Circuit opened");
    }

    fn close(&mut self, name: &str) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at = None;
        self.opened_at_utc = None;
        self.probe_in_flight = false;
        info!(breaker = %name, "Circuit closed");
    }
}

/// Circuit breaker protecting one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

/// Admission ticket for one call through a breaker.
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping an unreported probe frees the
/// half-open slot without counting an outcome.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success(self.probe);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.reported {
            let mut st = self.breaker.state.lock();
            st.probe_in_flight = false;
            debug!(breaker = %self.breaker.name, "Probe abandoned");
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Ask to make one call. Fails with [`OverseerError::CircuitOpen`] when
    /// the breaker is open or a half-open probe is already in flight.
    pub fn try_acquire(&self) -> OverseerResult<CallPermit<'_>> {
        let mut st = self.state.lock();
        st.total_calls += 1;

        if st.state == CircuitState::Open {
            let timeout = self.config.recovery_timeout();
            let elapsed = st.opened_at.map_or(timeout, |t| t.elapsed());
            if elapsed < timeout {
                st.rejected_calls += 1;
                return Err(self.open_error(timeout - elapsed));
            }
            st.state = CircuitState::HalfOpen;
            st.success_count = 0;
            st.probe_in_flight = false;
            info!(breaker = %self.name, "Circuit half-open, probing");
        }

        if st.state == CircuitState::HalfOpen {
            if st.probe_in_flight {
                st.rejected_calls += 1;
                return Err(self.open_error(Duration::ZERO));
            }
            st.probe_in_flight = true;
            return Ok(CallPermit {
                breaker: self,
                probe: true,
                reported: false,
            });
        }

        Ok(CallPermit {
            breaker: self,
            probe: false,
            reported: false,
        })
    }

    /// Run `op` through the breaker. Any `Err` counts as a failure.
    pub async fn call<T, F, Fut>(&self, op: F) -> OverseerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OverseerResult<T>>,
    {
        let permit = self.try_acquire()?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                debug!(breaker = %self.name, error = %e, "Protected call failed");
                permit.failure();
                Err(e)
            }
        }
    }

    fn record_success(&self, probe: bool) {
        let mut st = self.state.lock();
        match st.state {
            CircuitState::Closed => st.failure_count = 0,
            CircuitState::HalfOpen if probe => {
                st.probe_in_flight = false;
                st.success_count += 1;
                debug!(
                    breaker = %self.name,
                    successes = st.success_count,
                    "Probe succeeded"
                );
                if st.success_count >= self.config.success_threshold {
                    st.close(&self.name);
                }
            }
            // A call admitted before the breaker opened; its outcome is stale.
            _ => {}
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut st = self.state.lock();
        match st.state {
            CircuitState::Closed => {
                st.failure_count += 1;
                if st.failure_count >= self.config.failure_threshold {
                    st.open(&self.name);
                }
            }
            CircuitState::HalfOpen => {
                if probe {
                    st.failure_count += 1;
                }
                st.open(&self.name);
            }
            CircuitState::Open => {}
        }
    }

    fn open_error(&self, retry_after: Duration) -> OverseerError {
        OverseerError::CircuitOpen {
            name: self.name.clone(),
            retry_after_ms: retry_after.as_millis() as u64,
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        self.state.lock().close(&self.name);
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.state.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            opened_at: st.opened_at_utc,
            total_calls: st.total_calls,
            rejected_calls: st.rejected_calls,
            config: self.config.clone(),
        }
    }
}

/// Independent breakers keyed by the name of the dependency they protect.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Use `config` instead of the default for the breaker called `name`.
    pub fn with_override(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Fetch the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return Arc::clone(existing);
        }
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.default_config.clone());
            debug!(breaker = %name, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(name, config))
        });
        Arc::clone(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Run `op` through the breaker for `name`.
    pub async fn call<T, F, Fut>(&self, name: &str, op: F) -> OverseerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OverseerResult<T>>,
    {
        let breaker = self.get_or_create(name);
        breaker.call(op).await
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snaps: Vec<CircuitBreakerSnapshot> =
            self.breakers.read().values().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        snaps
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 50,
            success_threshold: 2,
        }
    }

    async fn fail(b: &CircuitBreaker) -> OverseerResult<()> {
        b.call(|| async { Err::<(), _>(OverseerError::Tool("down".into())) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> OverseerResult<u32> {
        b.call(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let b = CircuitBreaker::new("api", fast_config());
        for _ in 0..3 {
            assert!(fail(&b).await.is_err());
        }
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let res = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(OverseerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = CircuitBreaker::new("api", fast_config());
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        succeed(&b).await.unwrap();
        assert_eq!(b.snapshot().failure_count, 0);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_recovery_closes() {
        let b = CircuitBreaker::new("api", fast_config());
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let b = CircuitBreaker::new("api", fast_config());
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        let first_open = b.snapshot().opened_at.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.snapshot().opened_at.unwrap() > first_open);
        assert!(matches!(
            succeed(&b).await,
            Err(OverseerError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_single_probe_in_half_open() {
        let b = CircuitBreaker::new("api", fast_config());
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        let probe = b.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert!(b.try_acquire().is_err());
        drop(probe);
        // Abandoned probe frees the slot.
        let probe = b.try_acquire().unwrap();
        probe.success();
        assert_eq!(b.snapshot().success_count, 1);
    }

    #[test]
    fn test_registry_keys_independent_breakers() {
        let reg = CircuitBreakerRegistry::new(fast_config()).with_override(
            "fragile",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..fast_config()
            },
        );
        let a = reg.get_or_create("fragile");
        let b = reg.get_or_create("sturdy");
        assert_eq!(a.config().failure_threshold, 1);
        assert_eq!(b.config().failure_threshold, 3);
        assert!(Arc::ptr_eq(&a, &reg.get_or_create("fragile")));

        a.try_acquire().unwrap().failure();
        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(reg.snapshots().len(), 2);
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = fast_config();
        assert!(cfg.validate().is_ok());
        cfg.failure_threshold = 0;
        assert!(cfg.validate().is_err());
    }
}
