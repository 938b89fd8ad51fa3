//! Tool abstraction for the agent loop.
//!
//! Tools are capabilities exposed to the model during a run. Each tool
//! implements the [`Tool`] trait; instances are created per invocation by
//! a [`ToolFactory`] registered under a stable plugin id, so execution
//! state (`execute` then `readable_output`) never leaks between calls.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use helmsman_core::tokens::TokenContext;

pub mod catalog;
pub mod limits;

pub use catalog::{ResolvedTool, SchemaCache, ToolCatalog};

/// One violated argument constraint from [`Tool::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub property: String,
    pub message: String,
}

/// Context provided to tools during execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Correlation id of the owning run.
    pub run_id: String,
    pub tokens: TokenContext,
}

/// The core tool trait. One instance per invocation.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name exposed to the model. Also the registry plugin id.
    fn name(&self) -> &str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Check arguments against the tool's constraints. Empty = valid.
    fn validate(&self, _arguments: &serde_json::Value) -> Vec<Violation> {
        Vec::new()
    }

    /// Execute the tool. Side effects happen here; the result is read
    /// back through [`Tool::readable_output`].
    async fn execute(
        &mut self,
        arguments: &serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<()>;

    /// The output of the last execution, as text for the conversation.
    fn readable_output(&self) -> String;

    /// Downcast support for retrieval of typed tool results.
    fn as_any(&self) -> &dyn Any;
}

/// Creates fresh tool instances for a plugin id.
pub trait ToolFactory: Send + Sync {
    fn create(&self) -> Box<dyn Tool>;
}

impl<F> ToolFactory for F
where
    F: Fn() -> Box<dyn Tool> + Send + Sync,
{
    fn create(&self) -> Box<dyn Tool> {
        self()
    }
}

/// Registry of tool factories, keyed by stable plugin id. Resolved at
/// startup; no runtime reflection.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    factories: BTreeMap<String, Arc<dyn ToolFactory>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin_id: impl Into<String>, factory: Arc<dyn ToolFactory>) {
        self.factories.insert(plugin_id.into(), factory);
    }

    /// Instantiate a fresh tool. `None` when the plugin id is unknown.
    pub fn instantiate(&self, plugin_id: &str) -> Option<Box<dyn Tool>> {
        self.factories.get(plugin_id).map(|f| f.create())
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.factories.contains_key(plugin_id)
    }

    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }
}
