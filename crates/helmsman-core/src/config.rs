//! Agent configuration — persisted definitions, per-run overrides, and
//! tool usage limits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Provider-opaque model settings (temperature, max tokens, ...).
pub type ModelConfig = BTreeMap<String, serde_json::Value>;

/// A resolved provider/model pair a run is bound to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderBinding {
    pub provider_id: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: ModelConfig,
}

/// How a usage limit constrains one tool property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLimitAction {
    #[default]
    None,
    OnlyAllow,
    ForceValue,
}

/// Restriction applied to a single tool property before the tool's schema
/// is exposed to the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLimit {
    #[serde(default)]
    pub action: UsageLimitAction,
    /// Allowed values for `OnlyAllow`, or the forced value (first entry)
    /// for `ForceValue`. Token placeholders are substituted before the
    /// values are locked in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    /// Remove the property from the schema sent to the model entirely.
    /// The forced value still applies at execution time.
    #[serde(default)]
    pub hide_property: bool,
}

/// Usage limits keyed `plugin id -> property name -> limit`.
pub type UsageLimits = BTreeMap<String, BTreeMap<String, UsageLimit>>;

/// Per-tool settings on an agent definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    /// When true, the tool's output terminates the run as the answer,
    /// without another model call on that pass.
    #[serde(default)]
    pub return_directly: bool,
    /// For agent-as-tool entries: overrides handed to the child run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<ToolOverrides>,
}

/// Per-run replacement of the persisted tool configuration. When present
/// on a run it supersedes the agent definition for that run only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_limits: Option<UsageLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_directly: Option<BTreeMap<String, bool>>,
}

/// One pre-configured "information tool" executed while the system prompt
/// is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformationToolConfig {
    pub label: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
    /// Restrict execution to these loop counts. Empty means every pass,
    /// with the output folded into the system prompt; non-empty entries
    /// fire only on the listed counts and land in the conversation
    /// instead.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loops: Vec<u32>,
}

fn default_max_loops() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// A persisted agent: prompt material, tool wiring, and loop policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub label: String,

    #[serde(default)]
    pub description: String,

    /// User-editable instructions, exposed as the `agent:instructions`
    /// token.
    #[serde(default)]
    pub instructions: String,

    /// Operator-locked prompt template. When empty the prompt falls back
    /// to the bare `[agent:instructions]` placeholder.
    #[serde(default)]
    pub secured_prompt: String,

    /// Ceiling on model round-trips per determination. Immutable for the
    /// lifetime of a run.
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,

    /// When false, the loop stops after the first model response and
    /// leaves any requested tools pending for the caller.
    #[serde(default = "default_true")]
    pub looping_enabled: bool,

    /// Tool enablement, keyed by plugin id.
    #[serde(default)]
    pub tools: BTreeMap<String, bool>,

    #[serde(default)]
    pub tool_settings: BTreeMap<String, ToolSettings>,

    #[serde(default)]
    pub tool_usage_limits: UsageLimits,

    /// YAML block of [`InformationToolConfig`] entries. Parsed leniently:
    /// a malformed block contributes nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_information_tools: Option<String>,

    /// Default model binding. A run without one is bound lazily from the
    /// provider registry's chat-with-tools default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_binding: Option<ProviderBinding>,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: String::new(),
            instructions: String::new(),
            secured_prompt: String::new(),
            max_loops: default_max_loops(),
            looping_enabled: true,
            tools: BTreeMap::new(),
            tool_settings: BTreeMap::new(),
            tool_usage_limits: UsageLimits::new(),
            default_information_tools: None,
            default_binding: None,
        }
    }

    /// Effective tool enablement, honoring a per-run override when given.
    pub fn enabled_tools(&self, overrides: Option<&ToolOverrides>) -> Vec<String> {
        let map = overrides
            .and_then(|o| o.tools.as_ref())
            .unwrap_or(&self.tools);
        map.iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Effective usage limits, honoring a per-run override when given.
    pub fn usage_limits<'a>(&'a self, overrides: Option<&'a ToolOverrides>) -> &'a UsageLimits {
        overrides
            .and_then(|o| o.usage_limits.as_ref())
            .unwrap_or(&self.tool_usage_limits)
    }

    /// Effective return-directly flag for one tool. The override wins;
    /// default false.
    pub fn returns_directly(&self, overrides: Option<&ToolOverrides>, plugin_id: &str) -> bool {
        if let Some(map) = overrides.and_then(|o| o.return_directly.as_ref()) {
            return map.get(plugin_id).copied().unwrap_or(false);
        }
        self.tool_settings
            .get(plugin_id)
            .map(|s| s.return_directly)
            .unwrap_or(false)
    }

    /// Overrides a sub-agent entry hands to its child run.
    pub fn child_overrides(&self, plugin_id: &str) -> Option<ToolOverrides> {
        self.tool_settings
            .get(plugin_id)
            .and_then(|s| s.overrides.clone())
    }

    /// Parse the information-tools block. Parsing failure of optional
    /// enrichment data is non-fatal and yields an empty list.
    pub fn information_tools(&self) -> Vec<InformationToolConfig> {
        let Some(raw) = self.default_information_tools.as_deref() else {
            return Vec::new();
        };
        if raw.trim().is_empty() {
            return Vec::new();
        }
        match serde_yaml::from_str::<Vec<InformationToolConfig>>(raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(agent = %self.id, error = %e, "Malformed information tools block, ignoring");
                Vec::new()
            }
        }
    }
}
