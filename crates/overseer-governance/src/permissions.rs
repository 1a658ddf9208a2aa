use crate::registry::ToolRegistry;
use overseer_resilience::FixedWindow;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const TOOL_WINDOW: Duration = Duration::from_secs(60);

/// Tools an agent may invoke. The name `*` grants every registered tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermissionSet {
    tools: BTreeSet<String>,
}

impl ToolPermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        let mut set = Self::new();
        set.grant("*");
        set
    }

    pub fn grant(&mut self, tool: impl Into<String>) {
        self.tools.insert(tool.into());
    }

    pub fn revoke(&mut self, tool: &str) -> bool {
        self.tools.remove(tool)
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.tools.contains("*") || self.tools.contains(tool)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.tools.iter()
    }
}

impl<S: Into<String>> FromIterator<S> for ToolPermissionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            tools: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AccessDecision {
    Allow,
    Deny { reason: String },
    RequireApproval,
    RateLimited { retry_after_ms: u64 },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

/// Forbidden parameters passed to a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidParameters {
    pub tool_name: String,
    pub forbidden: Vec<String>,
}

impl fmt::Display for InvalidParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "forbidden parameters for '{}': {}",
            self.tool_name,
            self.forbidden.join(", ")
        )
    }
}

/// Decides whether an agent may call a tool.
///
/// Precedence is Deny, then RateLimited, then RequireApproval, then Allow.
/// Tool rate limits are one-minute windows per `(agent, tool)` pair, kept
/// apart from the general-purpose [`RateLimiter`](overseer_resilience::RateLimiter).
pub struct PermissionsEngine {
    registry: Arc<ToolRegistry>,
    grants: RwLock<HashMap<String, ToolPermissionSet>>,
    windows: Mutex<HashMap<(String, String), FixedWindow>>,
}

impl PermissionsEngine {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            grants: RwLock::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn set_permissions(&self, agent_id: impl Into<String>, permissions: ToolPermissionSet) {
        self.grants.write().insert(agent_id.into(), permissions);
    }

    pub fn grant(&self, agent_id: &str, tool: impl Into<String>) {
        self.grants
            .write()
            .entry(agent_id.to_string())
            .or_default()
            .grant(tool);
    }

    pub fn revoke(&self, agent_id: &str, tool: &str) -> bool {
        self.grants
            .write()
            .get_mut(agent_id)
            .is_some_and(|set| set.revoke(tool))
    }

    pub fn permissions(&self, agent_id: &str) -> ToolPermissionSet {
        self.grants.read().get(agent_id).cloned().unwrap_or_default()
    }

    /// Decide whether `agent_id` may call `tool_name` now. Does not consume
    /// rate-limit budget; see [`admit`](Self::admit).
    pub fn check_access(&self, agent_id: &str, tool_name: &str) -> AccessDecision {
        self.check_access_at(agent_id, tool_name, Instant::now())
    }

    /// Decide like [`check_access`](Self::check_access) and, when the call is
    /// admitted, count it against the `(agent, tool)` window. The check and
    /// the charge happen under one lock, so concurrent callers can never
    /// overshoot the limit.
    pub fn admit(&self, agent_id: &str, tool_name: &str) -> AccessDecision {
        self.admit_at(agent_id, tool_name, Instant::now())
    }

    fn check_access_at(&self, agent_id: &str, tool_name: &str, now: Instant) -> AccessDecision {
        self.decide_at(agent_id, tool_name, now, false)
    }

    fn admit_at(&self, agent_id: &str, tool_name: &str, now: Instant) -> AccessDecision {
        self.decide_at(agent_id, tool_name, now, true)
    }

    fn decide_at(
        &self,
        agent_id: &str,
        tool_name: &str,
        now: Instant,
        consume: bool,
    ) -> AccessDecision {
        let Some(spec) = self.registry.spec(tool_name) else {
            warn!(agent_id = %agent_id, tool = %tool_name, "Access denied: unknown tool");
            return AccessDecision::Deny {
                reason: format!("unknown tool '{tool_name}'"),
            };
        };
        let granted = self
            .grants
            .read()
            .get(agent_id)
            .is_some_and(|set| set.allows(tool_name));
        if !granted {
            warn!(agent_id = %agent_id, tool = %tool_name, "Access denied: not granted");
            return AccessDecision::Deny {
                reason: format!("agent '{agent_id}' is not granted '{tool_name}'"),
            };
        }

        if let Some(limit) = spec.rate_limit_per_minute {
            let mut windows = self.windows.lock();
            let key = (agent_id.to_string(), tool_name.to_string());
            let window = if consume {
                Some(
                    windows
                        .entry(key)
                        .or_insert_with(|| FixedWindow::new(TOOL_WINDOW, now)),
                )
            } else {
                windows.get_mut(&key)
            };
            if let Some(window) = window {
                window.refresh(now);
                if window.is_exhausted(limit) {
                    let retry_after_ms = window.resets_in(now).as_millis() as u64;
                    warn!(
                        agent_id = %agent_id,
                        tool = %tool_name,
                        limit,
                        retry_after_ms,
                        "Tool rate limit exhausted"
                    );
                    return AccessDecision::RateLimited { retry_after_ms };
                }
                if consume {
                    window.hit();
                    debug!(
                        agent_id = %agent_id,
                        tool = %tool_name,
                        count = window.count(),
                        "Tool call counted"
                    );
                }
            }
        }

        if spec.requires_approval {
            return AccessDecision::RequireApproval;
        }
        AccessDecision::Allow
    }

    /// Reject parameters the tool declares as forbidden. Unknown tools pass;
    /// access checks catch those.
    pub fn validate_parameters(
        &self,
        tool_name: &str,
        params: &Map<String, Value>,
    ) -> Result<(), InvalidParameters> {
        let Some(spec) = self.registry.spec(tool_name) else {
            return Ok(());
        };
        let forbidden: Vec<String> = spec
            .forbidden_parameters
            .iter()
            .filter(|name| params.contains_key(name.as_str()))
            .cloned()
            .collect();
        if forbidden.is_empty() {
            Ok(())
        } else {
            Err(InvalidParameters {
                tool_name: tool_name.to_string(),
                forbidden,
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tool::{tool_fn, ToolSpec};
    use serde_json::json;

    fn engine() -> PermissionsEngine {
        let reg = Arc::new(ToolRegistry::new());
        let noop = || tool_fn(|_| async { Ok(json!(null)) });
        reg.register(ToolSpec::new("search").with_rate_limit(2), noop())
            .unwrap();
        reg.register(ToolSpec::new("deploy").requiring_approval(), noop())
            .unwrap();
        reg.register(
            ToolSpec::new("shell")
                .requiring_approval()
                .with_rate_limit(1)
                .with_forbidden_parameters(["sudo", "env"]),
            noop(),
        )
        .unwrap();
        PermissionsEngine::new(reg)
    }

    #[test]
    fn test_unknown_or_ungranted_is_denied() {
        let e = engine();
        e.grant("a1", "search");
        assert!(matches!(e.check_access("a1", "nope"), AccessDecision::Deny { .. }));
        assert!(matches!(e.check_access("a1", "deploy"), AccessDecision::Deny { .. }));
        assert!(matches!(e.check_access("a2", "search"), AccessDecision::Deny { .. }));
        assert_eq!(e.check_access("a1", "search"), AccessDecision::Allow);
    }

    #[test]
    fn test_wildcard_grant() {
        let e = engine();
        e.set_permissions("root", ToolPermissionSet::all());
        assert_eq!(e.check_access("root", "search"), AccessDecision::Allow);
        assert_eq!(e.check_access("root", "deploy"), AccessDecision::RequireApproval);
        // Wildcard does not conjure unregistered tools.
        assert!(matches!(e.check_access("root", "nope"), AccessDecision::Deny { .. }));
    }

    #[test]
    fn test_rate_limit_per_agent_and_window() {
        let e = engine();
        e.grant("a1", "search");
        e.grant("a2", "search");
        let now = Instant::now();
        assert_eq!(e.admit_at("a1", "search", now), AccessDecision::Allow);
        assert_eq!(e.admit_at("a1", "search", now), AccessDecision::Allow);
        assert!(matches!(
            e.check_access_at("a1", "search", now),
            AccessDecision::RateLimited { retry_after_ms } if retry_after_ms > 0
        ));
        assert_eq!(e.check_access_at("a2", "search", now), AccessDecision::Allow);
        assert_eq!(
            e.check_access_at("a1", "search", now + Duration::from_secs(61)),
            AccessDecision::Allow
        );
    }

    #[test]
    fn test_rate_limited_outranks_approval() {
        let e = engine();
        e.grant("a1", "shell");
        assert_eq!(e.check_access("a1", "shell"), AccessDecision::RequireApproval);
        assert_eq!(e.admit("a1", "shell"), AccessDecision::RequireApproval);
        assert!(matches!(
            e.check_access("a1", "shell"),
            AccessDecision::RateLimited { .. }
        ));
        assert!(e.revoke("a1", "shell"));
        assert!(matches!(e.check_access("a1", "shell"), AccessDecision::Deny { .. }));
    }

    #[test]
    fn test_admit_charges_only_admitted_calls() {
        let e = engine();
        e.grant("a1", "search");
        let now = Instant::now();
        assert!(matches!(e.admit_at("a2", "search", now), AccessDecision::Deny { .. }));
        assert_eq!(e.admit_at("a1", "search", now), AccessDecision::Allow);
        assert_eq!(e.admit_at("a1", "search", now), AccessDecision::Allow);
        // Rejected admissions do not push the window further.
        for _ in 0..3 {
            assert!(matches!(
                e.admit_at("a1", "search", now),
                AccessDecision::RateLimited { .. }
            ));
        }
        assert_eq!(
            e.admit_at("a1", "search", now + Duration::from_secs(61)),
            AccessDecision::Allow
        );
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_limit() {
        let e = Arc::new(engine());
        e.grant("a1", "search");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let e = Arc::clone(&e);
                std::thread::spawn(move || e.admit("a1", "search").is_allowed())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(admitted, 2);
    }

    #[test]
    fn test_validate_parameters() {
        let e = engine();
        let mut params = Map::new();
        params.insert("cmd".into(), json!("ls"));
        assert!(e.validate_parameters("shell", &params).is_ok());
        params.insert("sudo".into(), json!(true));
        let err = e.validate_parameters("shell", &params).unwrap_err();
        assert_eq!(err.forbidden, vec!["sudo".to_string()]);
        assert!(err.to_string().contains("sudo"));
    }
}
