//! Snapshot capture/restore — the serializable record of an in-flight
//! run, exact enough to resume between requests.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use helmsman_core::config::{ProviderBinding, ToolOverrides};
use helmsman_core::tokens::TokenContext;
use helmsman_core::types::{ChatRole, ChatTurn};
use helmsman_tools::ToolRegistry;

use crate::invocation::{ToolInvocation, ToolKind};
use crate::run::AgentRun;

/// One completed tool call as persisted: the readable output plus, for a
/// sub-agent invocation, the nested run's own full snapshot. The child
/// snapshot is keyed to this entry (and its call id) rather than matched
/// back by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationSnapshot {
    pub tool_call_id: String,
    pub plugin_id: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_run: Option<Box<RunSnapshot>>,
}

/// The full persistable state of an [`AgentRun`].
///
/// Pending tool calls are not stored: they are reconstructed from the
/// trailing assistant turn's tool-call metadata minus already-answered
/// call ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub runner_id: String,
    pub loop_count: u32,
    pub finished: bool,
    pub looping_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ChatTurn>,
    #[serde(default)]
    pub token_context: TokenContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<ProviderBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_overrides: Option<ToolOverrides>,
    #[serde(default)]
    pub completed_tools: Vec<ToolInvocationSnapshot>,
}

impl RunSnapshot {
    /// Capture the run's state. Pure read; the run is untouched.
    pub fn capture(run: &AgentRun) -> Self {
        Self {
            runner_id: run.runner_id.clone(),
            loop_count: run.loop_count,
            finished: run.finished,
            looping_enabled: run.looping_enabled,
            task: run.task.clone(),
            answer: run.answer.clone(),
            conversation: run.conversation.clone(),
            token_context: run.token_context.clone(),
            binding: run.binding.clone(),
            tool_overrides: run.tool_overrides.clone(),
            completed_tools: run.completed_tools.iter().map(capture_invocation).collect(),
        }
    }

    /// Rebuild a run from this snapshot. Executables are re-resolved by
    /// plugin id and captured output re-attached; nothing is executed. A
    /// plugin id that no longer resolves degrades that single entry to an
    /// unresolved slot rather than failing the restore.
    pub fn restore(&self, registry: &ToolRegistry) -> AgentRun {
        let mut run = AgentRun {
            runner_id: self.runner_id.clone(),
            loop_count: self.loop_count,
            finished: self.finished,
            looping_enabled: self.looping_enabled,
            task: self.task.clone(),
            answer: self.answer.clone(),
            conversation: self.conversation.clone(),
            pending_tools: Vec::new(),
            completed_tools: self
                .completed_tools
                .iter()
                .map(|entry| restore_invocation(entry, registry))
                .collect(),
            token_context: self.token_context.clone(),
            binding: self.binding.clone(),
            tool_overrides: self.tool_overrides.clone(),
        };

        if !run.finished {
            run.pending_tools = reconstruct_pending(&run.conversation, registry);
        }
        run
    }
}

fn capture_invocation(invocation: &ToolInvocation) -> ToolInvocationSnapshot {
    ToolInvocationSnapshot {
        tool_call_id: invocation.tool_call_id.clone(),
        plugin_id: invocation.plugin_id.clone(),
        arguments: invocation.arguments.clone(),
        output: invocation.output.clone(),
        sub_run: match &invocation.kind {
            ToolKind::SubAgent(run) => Some(Box::new(RunSnapshot::capture(run))),
            _ => None,
        },
    }
}

fn restore_invocation(entry: &ToolInvocationSnapshot, registry: &ToolRegistry) -> ToolInvocation {
    let kind = if let Some(sub_run) = &entry.sub_run {
        ToolKind::SubAgent(Box::new(sub_run.restore(registry)))
    } else if let Some(tool) = registry.instantiate(&entry.plugin_id) {
        ToolKind::Leaf(tool)
    } else {
        warn!(tool = %entry.plugin_id, "Completed tool no longer resolves, restoring without executable");
        ToolKind::Unresolved
    };

    ToolInvocation {
        tool_call_id: entry.tool_call_id.clone(),
        plugin_id: entry.plugin_id.clone(),
        arguments: entry.arguments.clone(),
        kind,
        output: entry.output.clone(),
    }
}

/// Rebuild the currently-active tool call set from the conversation's
/// trailing tool-call metadata. A request whose executable no longer
/// resolves is restored as an unresolved slot; the loop resolves it again
/// (or reports it unknown) at execution time.
fn reconstruct_pending(conversation: &[ChatTurn], registry: &ToolRegistry) -> Vec<ToolInvocation> {
    let answered: HashSet<&str> = conversation
        .iter()
        .filter(|turn| turn.role == ChatRole::Tool)
        .filter_map(|turn| turn.tool_call_id.as_deref())
        .collect();

    let Some(last_assistant) = conversation
        .iter()
        .rev()
        .find(|turn| turn.role == ChatRole::Assistant)
    else {
        return Vec::new();
    };

    last_assistant
        .tool_calls
        .iter()
        .filter(|request| !answered.contains(request.id.as_str()))
        .map(|request| {
            let kind = registry
                .instantiate(&request.function_name)
                .map(ToolKind::Leaf)
                .unwrap_or(ToolKind::Unresolved);
            ToolInvocation::new(
                request.id.clone(),
                request.function_name.clone(),
                request.arguments.clone(),
                kind,
            )
        })
        .collect()
}
