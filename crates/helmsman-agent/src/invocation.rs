//! Tool invocation bookkeeping — one requested call, its executable, and
//! its captured result.

use helmsman_tools::Tool;

use crate::run::AgentRun;

/// What a requested call resolved to.
///
/// A sub-agent is itself a tool: its invocation owns a complete nested
/// [`AgentRun`], so recursive result retrieval is a structural recursion
/// over this variant.
pub enum ToolKind {
    /// An executable tool instance from the registry.
    Leaf(Box<dyn Tool>),
    /// A nested agent run. The child's loop ceiling is its own; a
    /// parent's does not bound it.
    SubAgent(Box<AgentRun>),
    /// No executable could be resolved for the plugin id. The recorded
    /// arguments and output are retained so snapshots stay lossless.
    Unresolved,
}

impl std::fmt::Debug for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolKind::Leaf(tool) => f.debug_tuple("Leaf").field(&tool.name()).finish(),
            ToolKind::SubAgent(run) => f.debug_tuple("SubAgent").field(&run.runner_id()).finish(),
            ToolKind::Unresolved => write!(f, "Unresolved"),
        }
    }
}

/// A single tool call: the model's request plus, once executed, its
/// result.
#[derive(Debug)]
pub struct ToolInvocation {
    /// The model's id for this call. Stable across snapshot restore.
    pub tool_call_id: String,
    pub plugin_id: String,
    pub arguments: serde_json::Value,
    pub(crate) kind: ToolKind,
    pub(crate) output: Option<String>,
}

impl ToolInvocation {
    pub(crate) fn new(
        tool_call_id: impl Into<String>,
        plugin_id: impl Into<String>,
        arguments: serde_json::Value,
        kind: ToolKind,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            plugin_id: plugin_id.into(),
            arguments,
            kind,
            output: None,
        }
    }

    pub fn kind(&self) -> &ToolKind {
        &self.kind
    }

    pub fn is_sub_agent(&self) -> bool {
        matches!(self.kind, ToolKind::SubAgent(_))
    }

    /// The nested run for a sub-agent invocation.
    pub fn sub_run(&self) -> Option<&AgentRun> {
        match &self.kind {
            ToolKind::SubAgent(run) => Some(run),
            _ => None,
        }
    }

    /// The executable behind a leaf invocation.
    pub fn tool(&self) -> Option<&dyn Tool> {
        match &self.kind {
            ToolKind::Leaf(tool) => Some(tool.as_ref()),
            _ => None,
        }
    }

    /// The result as text for the conversation. A sub-agent invocation
    /// resolves through its nested run's answer.
    pub fn readable_output(&self) -> String {
        if let ToolKind::SubAgent(run) = &self.kind {
            if let Some(answer) = run.answer() {
                return answer.to_string();
            }
        }
        self.output.clone().unwrap_or_default()
    }
}
