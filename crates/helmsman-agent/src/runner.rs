//! The run loop — one bounded solvability determination per call.
//!
//! Implemented as an explicit loop over a mutable [`AgentRun`], so stack
//! depth is constant in the loop ceiling; only nested sub-agent runs
//! recurse, through a boxed future.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use helmsman_core::config::AgentDefinition;
use helmsman_core::error::{HelmsmanError, Result};
use helmsman_core::tokens::{BracketReplacer, TokenReplacer};
use helmsman_core::types::{ChatTurn, ToolCallRequest};
use helmsman_providers::{Capability, ChatRequest, ProviderRegistry, ToolSchema};
use helmsman_tools::limits::{apply_usage_limits, constrain_arguments, AppliedLimits};
use helmsman_tools::{ResolvedTool, Tool, ToolCatalog, ToolContext};

use crate::invocation::{ToolInvocation, ToolKind};
use crate::prompt::{self, PromptHook};
use crate::run::AgentRun;

/// Outcome of one determination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Solvability {
    Solvable,
    /// The run hit its loop ceiling. A normal terminal outcome the caller
    /// must keep distinct from a successful empty answer.
    NotSolvable,
}

/// Agent definitions resolvable as tools, keyed by agent id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentDefinition>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: AgentDefinition) {
        self.agents.insert(definition.id.clone(), definition);
    }

    pub fn get(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }
}

/// What an exposed function name maps back to when the model requests it.
enum ResolvedEntry {
    Leaf(ResolvedTool),
    Agent(String),
}

/// Drives agent runs: builds prompts, executes requested tools, calls the
/// bound provider, and decides when a run terminates.
pub struct AgentRunner {
    providers: Arc<ProviderRegistry>,
    catalog: Arc<ToolCatalog>,
    agents: Arc<AgentRegistry>,
    replacer: Arc<dyn TokenReplacer>,
    prompt_hooks: Vec<Arc<dyn PromptHook>>,
}

impl AgentRunner {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        catalog: Arc<ToolCatalog>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            providers,
            catalog,
            agents,
            replacer: Arc::new(BracketReplacer),
            prompt_hooks: Vec::new(),
        }
    }

    pub fn with_replacer(mut self, replacer: Arc<dyn TokenReplacer>) -> Self {
        self.replacer = replacer;
        self
    }

    pub fn add_prompt_hook(&mut self, hook: Arc<dyn PromptHook>) {
        self.prompt_hooks.push(hook);
    }

    /// Run one solvability determination.
    ///
    /// Loops internally up to the definition's ceiling, one model round
    /// trip per pass. Tool validation and execution failures become the
    /// tool's result text and the loop proceeds; a provider failure is
    /// fatal for the whole run and propagates without retry.
    pub async fn determine_solvability(
        &self,
        definition: &AgentDefinition,
        run: &mut AgentRun,
    ) -> Result<Solvability> {
        loop {
            run.loop_count += 1;
            if run.loop_count > definition.max_loops {
                info!(
                    agent = %definition.id,
                    max_loops = definition.max_loops,
                    "Loop ceiling exceeded, job not solvable"
                );
                return Ok(Solvability::NotSolvable);
            }
            debug!(agent = %definition.id, pass = run.loop_count, "Determination pass");

            let built = prompt::build_system_prompt(
                definition,
                run,
                &self.catalog,
                self.replacer.as_ref(),
                &self.prompt_hooks,
            )
            .await;

            if run.loop_count == 1 && run.conversation.is_empty() {
                if let Some(task) = run.task.clone() {
                    run.conversation.push(ChatTurn::user(task));
                }
            }
            for turn in built.extra_turns {
                run.conversation.push(turn);
            }

            // Execute requested tools strictly in request order: later
            // calls may depend on state established by earlier ones.
            let mut queue: VecDeque<ToolInvocation> =
                std::mem::take(&mut run.pending_tools).into();
            while let Some(mut invocation) = queue.pop_front() {
                // Slots restored without an executable get one more
                // resolution attempt before they report as unknown.
                if matches!(invocation.kind, ToolKind::Unresolved) {
                    invocation.kind = self.resolve_kind(
                        definition,
                        run,
                        &invocation.plugin_id,
                        &invocation.arguments,
                    );
                }

                let result_text = match &mut invocation.kind {
                    ToolKind::Leaf(tool) => {
                        self.execute_leaf(definition, run, tool, &mut invocation.arguments)
                            .await
                    }
                    ToolKind::SubAgent(child) => match self.agents.get(&invocation.plugin_id) {
                        Some(child_def) => match self.run_nested(child_def, child).await? {
                            Solvability::Solvable => {
                                child.answer().unwrap_or_default().to_string()
                            }
                            Solvability::NotSolvable => format!(
                                "The {} agent could not complete the task within its loop limit.",
                                child_def.label
                            ),
                        },
                        None => format!("Unknown tool: {}", invocation.plugin_id),
                    },
                    ToolKind::Unresolved => format!("Unknown tool: {}", invocation.plugin_id),
                };

                info!(tool = %invocation.plugin_id, "Executed tool");
                invocation.output = Some(result_text.clone());
                run.conversation
                    .push(ChatTurn::tool(invocation.tool_call_id.clone(), result_text.clone()));

                let direct =
                    definition.returns_directly(run.tool_overrides.as_ref(), &invocation.plugin_id);
                run.completed_tools.push(invocation);

                if direct {
                    if !queue.is_empty() {
                        debug!(
                            discarded = queue.len(),
                            "Return-directly short-circuit, discarding remaining pending calls"
                        );
                    }
                    run.finished = true;
                    run.answer = Some(result_text);
                    return Ok(Solvability::Solvable);
                }
            }

            // Bind lazily: agent default first, then the registry's
            // chat-with-tools default, once for the run's lifetime.
            if run.binding.is_none() {
                run.binding = self
                    .providers
                    .default_binding(Capability::ChatWithTools)
                    .cloned();
            }
            let binding = run
                .binding
                .clone()
                .ok_or_else(|| HelmsmanError::Provider("no chat-with-tools provider bound".into()))?;
            let provider = self.providers.get(&binding.provider_id).ok_or_else(|| {
                HelmsmanError::Provider(format!("unknown provider: {}", binding.provider_id))
            })?;

            let (schemas, mut entries) = self.resolve_exposed_tools(definition, run);
            let response = provider
                .chat(ChatRequest {
                    model_id: &binding.model_id,
                    system_prompt: &built.system_prompt,
                    turns: &run.conversation,
                    tools: &schemas,
                    config: &binding.config,
                })
                .await
                .map_err(|e| HelmsmanError::Provider(e.to_string()))?;

            debug!(
                agent = %definition.id,
                tools_requested = response.tool_calls.len(),
                "Model responded"
            );
            run.conversation
                .push(ChatTurn::assistant(response.text.clone(), response.tool_calls.clone()));

            if response.tool_calls.is_empty() {
                run.finished = true;
                run.answer = Some(response.text);
                return Ok(Solvability::Solvable);
            }

            let invocations: Vec<ToolInvocation> = response
                .tool_calls
                .iter()
                .map(|request| self.make_invocation(definition, run, request, &mut entries))
                .collect();
            run.pending_tools = invocations;

            if !run.looping_enabled {
                debug!(agent = %definition.id, "Looping disabled, leaving requested tools pending");
                run.answer = Some(response.text);
                return Ok(Solvability::Solvable);
            }
        }
    }

    /// Boxed indirection for the one genuinely recursive call site.
    fn run_nested<'a>(
        &'a self,
        definition: &'a AgentDefinition,
        run: &'a mut AgentRun,
    ) -> BoxFuture<'a, Result<Solvability>> {
        self.determine_solvability(definition, run).boxed()
    }

    async fn execute_leaf(
        &self,
        definition: &AgentDefinition,
        run: &AgentRun,
        tool: &mut Box<dyn Tool>,
        arguments: &mut Value,
    ) -> String {
        let applied = match definition
            .usage_limits(run.tool_overrides())
            .get(tool.name())
        {
            Some(limits) => apply_usage_limits(
                &tool.parameters_schema(),
                limits,
                run.token_context(),
                self.replacer.as_ref(),
            ),
            None => AppliedLimits::default(),
        };

        let restricted = constrain_arguments(arguments, &applied);
        if !restricted.is_empty() {
            let messages: Vec<String> = restricted.into_iter().map(|(_, m)| m).collect();
            return strip_markup(&messages.join(" "));
        }

        let violations = tool.validate(arguments);
        if !violations.is_empty() {
            let messages: Vec<String> = violations.into_iter().map(|v| v.message).collect();
            return strip_markup(&messages.join(" "));
        }

        let context = ToolContext {
            run_id: run.runner_id().to_string(),
            tokens: run.token_context().clone(),
        };
        match tool.execute(arguments, &context).await {
            Ok(()) => tool.readable_output(),
            Err(e) => {
                warn!(tool = %tool.name(), error = %e, "Tool execution error");
                strip_markup(&e.to_string())
            }
        }
    }

    /// Resolve the exposed tool set for one pass: catalog tools with
    /// usage limits locked in, plus enabled agents as tools. An enabled
    /// id that resolves to neither is skipped for the pass.
    fn resolve_exposed_tools(
        &self,
        definition: &AgentDefinition,
        run: &AgentRun,
    ) -> (Vec<ToolSchema>, BTreeMap<String, ResolvedEntry>) {
        let overrides = run.tool_overrides();
        let usage_limits = definition.usage_limits(overrides);

        let mut leaf_ids = Vec::new();
        let mut agent_ids = Vec::new();
        for id in definition.enabled_tools(overrides) {
            if self.catalog.registry().contains(&id) {
                leaf_ids.push(id);
            } else if self.agents.contains(&id) {
                agent_ids.push(id);
            } else {
                warn!(tool = %id, "Enabled tool no longer resolves, skipping");
            }
        }

        let mut schemas = Vec::new();
        let mut entries = BTreeMap::new();

        for (plugin_id, tool) in self.catalog.resolve_enabled_tools(
            &leaf_ids,
            usage_limits,
            run.token_context(),
            self.replacer.as_ref(),
        ) {
            schemas.push(ToolSchema {
                name: plugin_id.clone(),
                description: tool.description.clone(),
                parameters: tool.limits.schema.clone(),
            });
            entries.insert(plugin_id, ResolvedEntry::Leaf(tool));
        }

        for agent_id in agent_ids {
            let Some(child) = self.agents.get(&agent_id) else {
                continue;
            };
            let description = if child.description.is_empty() {
                child.label.clone()
            } else {
                child.description.clone()
            };
            schemas.push(ToolSchema {
                name: agent_id.clone(),
                description,
                parameters: sub_agent_schema(),
            });
            entries.insert(agent_id.clone(), ResolvedEntry::Agent(agent_id));
        }

        (schemas, entries)
    }

    /// Turn one requested call into a deferred invocation, consuming the
    /// pre-resolved entry when one exists (the model may call the same
    /// tool twice in a pass, in which case a fresh instance is made).
    fn make_invocation(
        &self,
        definition: &AgentDefinition,
        run: &AgentRun,
        request: &ToolCallRequest,
        entries: &mut BTreeMap<String, ResolvedEntry>,
    ) -> ToolInvocation {
        let kind = match entries.remove(&request.function_name) {
            Some(ResolvedEntry::Leaf(tool)) => ToolKind::Leaf(tool.instance),
            Some(ResolvedEntry::Agent(agent_id)) => {
                self.child_kind(definition, run, &agent_id, &request.arguments)
            }
            None => {
                self.resolve_kind(definition, run, &request.function_name, &request.arguments)
            }
        };
        ToolInvocation::new(
            request.id.clone(),
            request.function_name.clone(),
            request.arguments.clone(),
            kind,
        )
    }

    /// Resolve a plugin id to an executable: registry tool first, then
    /// agent-as-tool, else unresolved (reported as unknown at execution).
    fn resolve_kind(
        &self,
        definition: &AgentDefinition,
        run: &AgentRun,
        plugin_id: &str,
        arguments: &Value,
    ) -> ToolKind {
        if let Some(tool) = self.catalog.instantiate(plugin_id) {
            ToolKind::Leaf(tool)
        } else if self.agents.contains(plugin_id) {
            self.child_kind(definition, run, plugin_id, arguments)
        } else {
            ToolKind::Unresolved
        }
    }

    /// Build the nested run for an agent-as-tool invocation: fresh loop
    /// counter, parent's token context, and any per-entry overrides the
    /// parent configures for this child.
    fn child_kind(
        &self,
        definition: &AgentDefinition,
        run: &AgentRun,
        agent_id: &str,
        arguments: &Value,
    ) -> ToolKind {
        let Some(child_def) = self.agents.get(agent_id) else {
            return ToolKind::Unresolved;
        };
        let mut child = AgentRun::new(child_def);
        child.token_context = run.token_context.clone();
        child.tool_overrides = definition.child_overrides(agent_id);
        child.task = arguments
            .get("prompt")
            .and_then(|v| v.as_str())
            .map(String::from);
        ToolKind::SubAgent(Box::new(child))
    }
}

fn sub_agent_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "prompt": {
                "type": "string",
                "description": "Task instructions for the sub-agent"
            }
        },
        "required": ["prompt"]
    })
}

/// Strip markup from failure text before it enters the conversation.
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}
