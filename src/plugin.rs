//! The plugin capability the executor invokes to run actions.
//!
//! A plugin is the abstract capability the executor invokes to run one
//! `Action`. Implementers write a typed [`Plugin`], with `type Request`/
//! `type Response` associated types rather than reflection-based
//! marshaling; the registry stores
//! them behind the dyn-compatible [`ErasedPlugin`] so the executor can
//! dispatch by name over opaque `serde_json::Value` payloads. The blanket
//! impl below is this crate's "re-marshal through the factory value"
//! strategy: concrete types, not reflection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::clone::{SecureFields, SecureFieldsLookup};
use crate::retry::RetryPolicy;

/// Error returned by a plugin's `init` or `execute`.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
pub struct PluginError {
    pub message: String,
    /// A permanent error skips remaining retries.
    pub permanent: bool,
    pub details: Option<serde_json::Value>,
}

impl PluginError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
            details: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PluginError {}

/// Per-attempt context handed to a plugin's `execute`.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub plan_id: crate::model::EntityId,
    pub action_id: crate::model::EntityId,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl PluginContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A typed action capability. Implementers write this trait; the registry
/// stores it behind [`ErasedPlugin`].
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    type Request: Serialize + DeserializeOwned + Default + Send + Sync;
    type Response: Serialize + DeserializeOwned + Send + Sync;

    fn name(&self) -> &str;

    /// Called once, concurrently with every other registered plugin, at
    /// `ExecutionService::new`.
    async fn init(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Whether this plugin may be used inside a `Checks` group. Start-time
    /// validation requires actions inside Checks objects to use a plugin
    /// marked as a check plugin.
    fn is_check_plugin(&self) -> bool {
        false
    }

    /// Top-level `Request`/`Response` field names that must be redacted by
    /// [`crate::model::clone::clone_plan`] unless secrets are kept.
    fn secure_fields(&self) -> SecureFields {
        SecureFields::default()
    }

    async fn execute(
        &self,
        ctx: &PluginContext,
        req: Self::Request,
    ) -> Result<Self::Response, PluginError>;
}

/// Dyn-compatible erasure of [`Plugin`], used by the registry and executor.
#[async_trait]
pub trait ErasedPlugin: Send + Sync {
    fn name(&self) -> &str;
    async fn init(&self) -> Result<(), PluginError>;
    fn retry_policy(&self) -> RetryPolicy;
    fn is_check_plugin(&self) -> bool;
    fn secure_fields(&self) -> SecureFields;

    /// Deserialize `req` into the plugin's concrete `Request` type, run it,
    /// and re-serialize the response to JSON. This is the crate's
    /// "reconstruct concrete types via factory" boundary.
    async fn execute_json(
        &self,
        ctx: &PluginContext,
        req: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError>;

    /// Zero-value request, used to validate a stored `Action.req` shape
    /// round-trips through this plugin's concrete type before execution.
    fn request_template(&self) -> serde_json::Value;
}

#[async_trait]
impl<P: Plugin> ErasedPlugin for P {
    fn name(&self) -> &str {
        Plugin::name(self)
    }

    async fn init(&self) -> Result<(), PluginError> {
        Plugin::init(self).await
    }

    fn retry_policy(&self) -> RetryPolicy {
        Plugin::retry_policy(self)
    }

    fn is_check_plugin(&self) -> bool {
        Plugin::is_check_plugin(self)
    }

    fn secure_fields(&self) -> SecureFields {
        Plugin::secure_fields(self)
    }

    async fn execute_json(
        &self,
        ctx: &PluginContext,
        req: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        let typed: P::Request = serde_json::from_value(req).map_err(|e| {
            PluginError::permanent(format!("request does not match plugin {}: {e}", self.name()))
        })?;
        let resp = Plugin::execute(self, ctx, typed).await?;
        serde_json::to_value(resp)
            .map_err(|e| PluginError::permanent(format!("response serialization failed: {e}")))
    }

    fn request_template(&self) -> serde_json::Value {
        serde_json::to_value(P::Request::default()).unwrap_or(serde_json::Value::Null)
    }
}

/// Error from registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("plugin not registered: {0}")]
    UnknownPlugin(String),
    #[error("plugin init failed: {0}")]
    InitFailed(#[from] PluginError),
}

/// Read-only-after-init registry of plugins by name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<HashMap<String, Arc<dyn ErasedPlugin>>>,
}

pub struct PluginRegistryBuilder {
    plugins: HashMap<String, Arc<dyn ErasedPlugin>>,
}

impl PluginRegistryBuilder {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register<P: Plugin>(mut self, plugin: P) -> Self {
        let name = Plugin::name(&plugin).to_string();
        self.plugins.insert(name, Arc::new(plugin));
        self
    }

    pub fn build(self) -> PluginRegistry {
        PluginRegistry {
            plugins: Arc::new(self.plugins),
        }
    }
}

impl Default for PluginRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ErasedPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Initialize every registered plugin concurrently; any failure aborts
    /// startup.
    #[tracing::instrument(skip_all, fields(count = self.plugins.len()))]
    pub async fn init_all(&self) -> Result<(), RegistryError> {
        try_join_all(self.plugins.values().map(|p| {
            let p = p.clone();
            async move { p.init().await.map_err(RegistryError::from) }
        }))
        .await?;
        Ok(())
    }
}

impl SecureFieldsLookup for PluginRegistry {
    fn secure_fields(&self, plugin: &str) -> SecureFields {
        self.get(plugin)
            .map(|p| p.secure_fields())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Default, Serialize, Deserialize)]
    struct EchoReq {
        value: i64,
    }

    #[derive(Serialize, Deserialize)]
    struct EchoResp {
        value: i64,
    }

    struct EchoPlugin;

    #[async_trait]
    impl Plugin for EchoPlugin {
        type Request = EchoReq;
        type Response = EchoResp;

        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            _ctx: &PluginContext,
            req: Self::Request,
        ) -> Result<Self::Response, PluginError> {
            Ok(EchoResp { value: req.value })
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name_through_json() {
        let registry = PluginRegistry::builder().register(EchoPlugin).build();
        let plugin = registry.get("echo").expect("registered");
        let ctx = PluginContext {
            plan_id: crate::model::EntityId::new(),
            action_id: crate::model::EntityId::new(),
            attempt: 1,
            max_attempts: 1,
        };
        let resp = plugin
            .execute_json(&ctx, serde_json::json!({"value": 42}))
            .await
            .unwrap();
        assert_eq!(resp["value"], 42);
    }

    #[tokio::test]
    async fn unknown_plugin_is_absent() {
        let registry = PluginRegistry::builder().register(EchoPlugin).build();
        assert!(registry.get("missing").is_none());
        assert!(!registry.contains("missing"));
    }

    #[tokio::test]
    async fn init_all_succeeds_for_default_plugins() {
        let registry = PluginRegistry::builder().register(EchoPlugin).build();
        registry.init_all().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_request_is_a_permanent_error() {
        let registry = PluginRegistry::builder().register(EchoPlugin).build();
        let plugin = registry.get("echo").unwrap();
        let ctx = PluginContext {
            plan_id: crate::model::EntityId::new(),
            action_id: crate::model::EntityId::new(),
            attempt: 1,
            max_attempts: 1,
        };
        let err = plugin
            .execute_json(&ctx, serde_json::json!({"value": "not a number"}))
            .await
            .unwrap_err();
        assert!(err.permanent);
    }
}
