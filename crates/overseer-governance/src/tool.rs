use async_trait::async_trait;
use overseer_core::{OverseerResult, RiskLevel};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

/// Declaration of a governed tool.
///
/// Loaded from `[[tools]]` entries in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
    /// Calls per agent per minute; `None` means unthrottled.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub requires_approval: bool,
    /// Parameter names that may never be passed to this tool.
    #[serde(default)]
    pub forbidden_parameters: Vec<String>,
    /// Read-only tool: concurrent calls with identical parameters share one
    /// execution.
    #[serde(default)]
    pub idempotent: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            risk_level: RiskLevel::default(),
            rate_limit_per_minute: None,
            requires_approval: false,
            forbidden_parameters: Vec::new(),
            idempotent: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn with_forbidden_parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden_parameters = names.into_iter().map(Into::into).collect();
        self
    }
}

/// An external tool invoked through the [`ExecutionGuard`](crate::ExecutionGuard).
#[async_trait]
pub trait Tool: Send + Sync {
    async fn invoke(&self, params: Map<String, Value>) -> OverseerResult<Value>;
}

struct FnTool<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = OverseerResult<Value>> + Send,
{
    async fn invoke(&self, params: Map<String, Value>) -> OverseerResult<Value> {
        (self.f)(params).await
    }
}

/// Wrap an async closure as a [`Tool`].
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn Tool>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OverseerResult<Value>> + Send + 'static,
{
    Arc::new(FnTool { f })
}

/// Result of a tool call that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub tool_name: String,
    pub value: Value,
    pub duration_ms: u64,
    /// Size in bytes of the serialized value.
    pub output_size: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: ToolSpec = serde_json::from_value(json!({"name": "shell"})).unwrap();
        assert_eq!(spec, ToolSpec::new("shell"));
        assert_eq!(spec.risk_level, RiskLevel::Medium);
        assert!(!spec.requires_approval);
    }

    #[tokio::test]
    async fn test_tool_fn_invokes_closure() {
        let echo = tool_fn(|params| async move { Ok(Value::Object(params)) });
        let mut params = Map::new();
        params.insert("q".into(), json!("rust"));
        let out = echo.invoke(params).await.unwrap();
        assert_eq!(out, json!({"q": "rust"}));
    }
}
