//! Chat model provider abstraction.
//!
//! Each provider implements the [`ChatProvider`] trait: one complete
//! round trip per call, returning the response text plus any tool calls
//! the model requested. Wire formatting, authentication, and retry policy
//! are the provider's business; the loop above treats a failed call as
//! fatal for the run.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use helmsman_core::config::{ModelConfig, ProviderBinding};
use helmsman_core::types::{ChatTurn, ToolCallRequest};

/// What a provider can do. Runs without an explicit binding are bound to
/// the registry default for `ChatWithTools`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ChatWithTools,
}

/// A tool schema as exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One chat round trip.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub model_id: &'a str,
    pub system_prompt: &'a str,
    pub turns: &'a [ChatTurn],
    pub tools: &'a [ToolSchema],
    pub config: &'a ModelConfig,
}

/// The model's complete response to one round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

/// The core chat provider trait.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider identifier (e.g., "anthropic", "openai").
    fn id(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// Run one complete chat round trip.
    async fn chat(&self, request: ChatRequest<'_>) -> anyhow::Result<ChatResponse>;
}

/// Registry of available providers plus per-capability default bindings.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ChatProvider>>,
    defaults: BTreeMap<Capability, ProviderBinding>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        self.providers.push(provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    /// Set the default binding used when a run has none of its own.
    pub fn set_default(&mut self, capability: Capability, binding: ProviderBinding) {
        self.defaults.insert(capability, binding);
    }

    pub fn default_binding(&self, capability: Capability) -> Option<&ProviderBinding> {
        self.defaults.get(&capability)
    }
}
