use crate::window::FixedWindow;
use overseer_core::{OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Time window a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    Minute,
    Hour,
    Day,
}

impl RateWindow {
    pub const ALL: [RateWindow; 3] = [RateWindow::Minute, RateWindow::Hour, RateWindow::Day];

    pub fn duration(self) -> Duration {
        match self {
            RateWindow::Minute => Duration::from_secs(60),
            RateWindow::Hour => Duration::from_secs(3_600),
            RateWindow::Day => Duration::from_secs(86_400),
        }
    }
}

/// Per-principal request limits. A `None` window is not enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub requests_per_minute: Option<u32>,
    #[serde(default = "default_per_hour")]
    pub requests_per_hour: Option<u32>,
    #[serde(default = "default_per_day")]
    pub requests_per_day: Option<u32>,
}

fn default_per_minute() -> Option<u32> {
    Some(60)
}
fn default_per_hour() -> Option<u32> {
    Some(1_000)
}
fn default_per_day() -> Option<u32> {
    Some(10_000)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_per_minute(),
            requests_per_hour: default_per_hour(),
            requests_per_day: default_per_day(),
        }
    }
}

impl RateLimitConfig {
    /// A config enforcing only a per-minute limit.
    pub fn per_minute(limit: u32) -> Self {
        Self {
            requests_per_minute: Some(limit),
            requests_per_hour: None,
            requests_per_day: None,
        }
    }

    pub fn limit_for(&self, window: RateWindow) -> Option<u32> {
        match window {
            RateWindow::Minute => self.requests_per_minute,
            RateWindow::Hour => self.requests_per_hour,
            RateWindow::Day => self.requests_per_day,
        }
    }

    pub fn validate(&self) -> OverseerResult<()> {
        for window in RateWindow::ALL {
            if self.limit_for(window) == Some(0) {
                return Err(OverseerError::Config(format!(
                    "rate limit for {window:?} window must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the tightest window after this one.
    pub remaining: u32,
    /// Set when denied: time until the exhausted window that resets soonest.
    pub retry_after: Option<Duration>,
}

/// Usage of one window for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub window: RateWindow,
    pub used: u32,
    pub limit: u32,
    pub resets_in_ms: u64,
}

struct PrincipalCounters {
    windows: HashMap<RateWindow, FixedWindow>,
    last_seen: Instant,
}

impl PrincipalCounters {
    fn new(now: Instant) -> Self {
        let windows = RateWindow::ALL
            .into_iter()
            .map(|w| (w, FixedWindow::new(w.duration(), now)))
            .collect();
        Self {
            windows,
            last_seen: now,
        }
    }
}

struct LimiterState {
    overrides: HashMap<String, RateLimitConfig>,
    counters: HashMap<String, PrincipalCounters>,
}

/// Multi-window fixed-counter rate limiter keyed by principal (user, tool...).
///
/// A request is admitted only when every configured window has capacity.
/// Distinct principals never share counters.
pub struct RateLimiter {
    default_config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            state: Mutex::new(LimiterState {
                overrides: HashMap::new(),
                counters: HashMap::new(),
            }),
        }
    }

    pub fn default_config(&self) -> &RateLimitConfig {
        &self.default_config
    }

    /// Give `principal` its own limits (e.g. elevated quotas).
    pub async fn set_custom_config(&self, principal: impl Into<String>, config: RateLimitConfig) {
        let mut state = self.state.lock().await;
        state.overrides.insert(principal.into(), config);
    }

    /// Drop a custom config; the default applies again.
    pub async fn remove_custom_config(&self, principal: &str) -> bool {
        let mut state = self.state.lock().await;
        state.overrides.remove(principal).is_some()
    }

    /// Evaluate all windows for `principal` and count the request if admitted.
    pub async fn check(&self, principal: &str) -> RateLimitDecision {
        self.check_at(principal, Instant::now()).await
    }

    pub(crate) async fn check_at(&self, principal: &str, now: Instant) -> RateLimitDecision {
        let mut state = self.state.lock().await;
        let config = state
            .overrides
            .get(principal)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone());
        let counters = state
            .counters
            .entry(principal.to_string())
            .or_insert_with(|| PrincipalCounters::new(now));
        counters.last_seen = now;

        let mut remaining = u32::MAX;
        let mut retry_after: Option<Duration> = None;
        for window in RateWindow::ALL {
            let Some(limit) = config.limit_for(window) else {
                continue;
            };
            let Some(counter) = counters.windows.get_mut(&window) else {
                continue;
            };
            counter.refresh(now);
            if counter.is_exhausted(limit) {
                let wait = counter.resets_in(now);
                retry_after = Some(retry_after.map_or(wait, |cur| cur.min(wait)));
            }
            remaining = remaining.min(counter.remaining(limit));
        }

        if let Some(wait) = retry_after {
            warn!(
                principal = %principal,
                retry_after_ms = wait.as_millis() as u64,
                "Rate limit exceeded"
            );
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after: Some(wait),
            };
        }

        for window in RateWindow::ALL {
            if config.limit_for(window).is_some() {
                if let Some(counter) = counters.windows.get_mut(&window) {
                    counter.hit();
                }
            }
        }
        let remaining = remaining.saturating_sub(1);
        debug!(principal = %principal, remaining, "Rate limit check passed");
        RateLimitDecision {
            allowed: true,
            remaining,
            retry_after: None,
        }
    }

    /// Like [`check`](Self::check) but turns a denial into
    /// [`OverseerError::RateLimitExceeded`].
    pub async fn enforce(&self, principal: &str) -> OverseerResult<RateLimitDecision> {
        let decision = self.check(principal).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(OverseerError::RateLimitExceeded {
                principal: principal.to_string(),
                retry_after_ms: decision
                    .retry_after
                    .map_or(0, |d| d.as_millis() as u64),
            })
        }
    }

    /// Current per-window usage for `principal`.
    pub async fn usage(&self, principal: &str) -> Vec<WindowUsage> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let config = state
            .overrides
            .get(principal)
            .unwrap_or(&self.default_config);
        state
            .counters
            .get(principal)
            .map(|c| window_usage(c, config, now))
            .unwrap_or_default()
    }

    /// Usage of every tracked principal.
    pub async fn usage_snapshot(&self) -> HashMap<String, Vec<WindowUsage>> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .counters
            .iter()
            .map(|(principal, counters)| {
                let config = state
                    .overrides
                    .get(principal)
                    .unwrap_or(&self.default_config);
                (principal.clone(), window_usage(counters, config, now))
            })
            .collect()
    }

    /// Forget all counters of `principal`.
    pub async fn reset(&self, principal: &str) {
        let mut state = self.state.lock().await;
        state.counters.remove(principal);
    }

    /// Remove counters of principals idle for at least `max_idle`.
    pub async fn cleanup(&self, max_idle: Duration) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let before = state.counters.len();
        state
            .counters
            .retain(|_, c| now.saturating_duration_since(c.last_seen) < max_idle);
        before - state.counters.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

fn window_usage(
    counters: &PrincipalCounters,
    config: &RateLimitConfig,
    now: Instant,
) -> Vec<WindowUsage> {
    RateWindow::ALL
        .into_iter()
        .filter_map(|window| {
            let limit = config.limit_for(window)?;
            let mut counter = counters.windows.get(&window)?.clone();
            counter.refresh(now);
            Some(WindowUsage {
                window,
                used: counter.count(),
                limit,
                resets_in_ms: counter.resets_in(now).as_millis() as u64,
            })
        })
        .collect()
}
