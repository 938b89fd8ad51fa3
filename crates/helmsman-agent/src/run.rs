//! Run state — the mutable aggregate one solvability determination works
//! on.

use helmsman_core::config::{AgentDefinition, ProviderBinding, ToolOverrides};
use helmsman_core::tokens::TokenContext;
use helmsman_core::types::ChatTurn;
use helmsman_tools::Tool;
use uuid::Uuid;

use crate::invocation::{ToolInvocation, ToolKind};

/// The full mutable state of one agent run.
///
/// Created fresh for a new conversation or rebuilt from a snapshot for a
/// continued one; mutated only by the run loop. Exclusively owned by one
/// execution context at a time.
#[derive(Debug)]
pub struct AgentRun {
    pub(crate) runner_id: String,
    pub(crate) loop_count: u32,
    pub(crate) finished: bool,
    pub(crate) looping_enabled: bool,
    pub(crate) task: Option<String>,
    pub(crate) answer: Option<String>,
    pub(crate) conversation: Vec<ChatTurn>,
    pub(crate) pending_tools: Vec<ToolInvocation>,
    pub(crate) completed_tools: Vec<ToolInvocation>,
    pub(crate) token_context: TokenContext,
    pub(crate) binding: Option<ProviderBinding>,
    pub(crate) tool_overrides: Option<ToolOverrides>,
}

impl AgentRun {
    pub fn new(definition: &AgentDefinition) -> Self {
        Self {
            runner_id: Uuid::new_v4().to_string(),
            loop_count: 0,
            finished: false,
            looping_enabled: definition.looping_enabled,
            task: None,
            answer: None,
            conversation: Vec::new(),
            pending_tools: Vec::new(),
            completed_tools: Vec::new(),
            token_context: TokenContext::new(),
            binding: definition.default_binding.clone(),
            tool_overrides: None,
        }
    }

    /// External correlation id for this run.
    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Completed model round-trips. At most `max_loops + 1`: the pass
    /// that exceeds the ceiling terminates before calling the model.
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn looping_enabled(&self) -> bool {
        self.looping_enabled
    }

    /// Disable looping: the next determination stops after one model
    /// response and leaves requested tools pending for the caller.
    pub fn set_looping_enabled(&mut self, enabled: bool) {
        self.looping_enabled = enabled;
    }

    /// Stage the task text seeded as the opening user turn on the first
    /// pass (unless the conversation was seeded directly).
    pub fn set_task(&mut self, task: impl Into<String>) {
        self.task = Some(task.into());
    }

    pub fn task(&self) -> Option<&str> {
        self.task.as_deref()
    }

    /// Seed the conversation from caller-supplied messages. Intended
    /// before the first pass; replaces any staged turns.
    pub fn seed_conversation(&mut self, turns: Vec<ChatTurn>) {
        self.conversation = turns;
    }

    pub fn conversation(&self) -> &[ChatTurn] {
        &self.conversation
    }

    /// The final answer once the run reports solvable.
    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    pub fn token_context(&self) -> &TokenContext {
        &self.token_context
    }

    pub fn token_context_mut(&mut self) -> &mut TokenContext {
        &mut self.token_context
    }

    pub fn binding(&self) -> Option<&ProviderBinding> {
        self.binding.as_ref()
    }

    pub fn set_binding(&mut self, binding: ProviderBinding) {
        self.binding = Some(binding);
    }

    pub fn tool_overrides(&self) -> Option<&ToolOverrides> {
        self.tool_overrides.as_ref()
    }

    /// Supersede the agent's persisted tool configuration for this run.
    pub fn set_tool_overrides(&mut self, overrides: ToolOverrides) {
        self.tool_overrides = Some(overrides);
    }

    /// Tool calls requested by the most recent response and not yet
    /// executed (non-empty only mid-run or with looping disabled).
    pub fn pending_tools(&self) -> &[ToolInvocation] {
        &self.pending_tools
    }

    /// The audit trail of every executed tool. With `recursive`, each
    /// sub-agent wrapper entry is followed by the child run's own results
    /// flattened in, to any depth.
    pub fn tool_results(&self, recursive: bool) -> Vec<&ToolInvocation> {
        let mut results = Vec::new();
        for invocation in &self.completed_tools {
            results.push(invocation);
            if recursive {
                if let ToolKind::SubAgent(run) = &invocation.kind {
                    results.extend(run.tool_results(true));
                }
            }
        }
        results
    }

    pub fn tool_results_by_plugin_id(&self, plugin_id: &str, recursive: bool) -> Vec<&ToolInvocation> {
        self.tool_results(recursive)
            .into_iter()
            .filter(|invocation| invocation.plugin_id == plugin_id)
            .collect()
    }

    /// Results whose executable is the concrete tool type `T`.
    pub fn tool_results_by_tool<T: Tool + 'static>(&self, recursive: bool) -> Vec<&ToolInvocation> {
        self.tool_results(recursive)
            .into_iter()
            .filter(|invocation| match &invocation.kind {
                ToolKind::Leaf(tool) => tool.as_any().is::<T>(),
                _ => false,
            })
            .collect()
    }
}
