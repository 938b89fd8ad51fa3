//! End-to-end loop tests with a scripted provider and recording tools.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use helmsman_agent::{AgentRegistry, AgentRun, AgentRunner, RunSnapshot, Solvability};
use helmsman_core::config::{
    AgentDefinition, ModelConfig, ProviderBinding, ToolOverrides, ToolSettings, UsageLimit,
    UsageLimitAction, UsageLimits,
};
use helmsman_core::error::HelmsmanError;
use helmsman_core::types::{ChatRole, ToolCallRequest};
use helmsman_providers::{
    Capability, ChatProvider, ChatRequest, ChatResponse, ProviderRegistry, ToolSchema,
};
use helmsman_tools::{Tool, ToolCatalog, ToolContext, ToolRegistry, Violation};

// --- Scripted provider ---

#[derive(Clone)]
struct RecordedCall {
    system_prompt: String,
    tool_names: Vec<String>,
    schemas: Vec<ToolSchema>,
    turns: usize,
}

struct ScriptedProvider {
    responses: Mutex<VecDeque<ChatResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::ChatWithTools]
    }

    async fn chat(&self, request: ChatRequest<'_>) -> anyhow::Result<ChatResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            system_prompt: request.system_prompt.to_string(),
            tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
            schemas: request.tools.to_vec(),
            turns: request.turns.len(),
        });
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text_response("done")))
    }
}

struct BrokenProvider;

#[async_trait]
impl ChatProvider for BrokenProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::ChatWithTools]
    }

    async fn chat(&self, _request: ChatRequest<'_>) -> anyhow::Result<ChatResponse> {
        anyhow::bail!("connection reset")
    }
}

fn text_response(text: &str) -> ChatResponse {
    ChatResponse {
        text: text.into(),
        tool_calls: Vec::new(),
    }
}

fn tool_response(id: &str, function: &str, arguments: Value) -> ChatResponse {
    ChatResponse {
        text: "Using a tool.".into(),
        tool_calls: vec![ToolCallRequest {
            id: id.into(),
            function_name: function.into(),
            arguments,
        }],
    }
}

// --- Test tools ---

#[derive(Default)]
struct EchoTool {
    output: String,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes its input back."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&mut self, arguments: &Value, _context: &ToolContext) -> anyhow::Result<()> {
        self.output = arguments
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(())
    }

    fn readable_output(&self) -> String {
        self.output.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct MarkerTool {
    fired: bool,
}

#[async_trait]
impl Tool for MarkerTool {
    fn name(&self) -> &str {
        "marker"
    }

    fn description(&self) -> &str {
        "Leaves a marker."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&mut self, _arguments: &Value, _context: &ToolContext) -> anyhow::Result<()> {
        self.fired = true;
        Ok(())
    }

    fn readable_output(&self) -> String {
        "marked".into()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct PublisherTool {
    output: String,
}

#[async_trait]
impl Tool for PublisherTool {
    fn name(&self) -> &str {
        "publisher"
    }

    fn description(&self) -> &str {
        "Publishes an item into a bundle."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": { "type": "string" },
                "bundle": { "type": "string" }
            },
            "required": ["status", "bundle"]
        })
    }

    async fn execute(&mut self, arguments: &Value, _context: &ToolContext) -> anyhow::Result<()> {
        self.output = format!(
            "published {} as {}",
            arguments["bundle"].as_str().unwrap_or("?"),
            arguments["status"].as_str().unwrap_or("?"),
        );
        Ok(())
    }

    fn readable_output(&self) -> String {
        self.output.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct StrictTool;

#[async_trait]
impl Tool for StrictTool {
    fn name(&self) -> &str {
        "strict"
    }

    fn description(&self) -> &str {
        "Requires a query argument."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "q": { "type": "string" } },
            "required": ["q"]
        })
    }

    fn validate(&self, arguments: &Value) -> Vec<Violation> {
        if arguments.get("q").and_then(|v| v.as_str()).is_none() {
            return vec![Violation {
                property: "q".into(),
                message: "q is required.".into(),
            }];
        }
        Vec::new()
    }

    async fn execute(&mut self, _arguments: &Value, _context: &ToolContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn readable_output(&self) -> String {
        "queried".into()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "failing"
    }

    fn description(&self) -> &str {
        "Always fails."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&mut self, _arguments: &Value, _context: &ToolContext) -> anyhow::Result<()> {
        anyhow::bail!("<em>boom</em>")
    }

    fn readable_output(&self) -> String {
        String::new()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// --- Harness ---

fn tool_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register("echo", Arc::new(|| Box::new(EchoTool::default()) as Box<dyn Tool>));
    registry.register("marker", Arc::new(|| Box::new(MarkerTool::default()) as Box<dyn Tool>));
    registry.register(
        "publisher",
        Arc::new(|| Box::new(PublisherTool::default()) as Box<dyn Tool>),
    );
    registry.register("strict", Arc::new(|| Box::new(StrictTool) as Box<dyn Tool>));
    registry.register("failing", Arc::new(|| Box::new(FailingTool) as Box<dyn Tool>));
    Arc::new(registry)
}

struct Harness {
    provider: Arc<ScriptedProvider>,
    registry: Arc<ToolRegistry>,
    runner: AgentRunner,
}

fn harness(responses: Vec<ChatResponse>, agents: AgentRegistry) -> Harness {
    let provider = ScriptedProvider::new(responses);
    let mut providers = ProviderRegistry::new();
    providers.register(provider.clone());
    providers.set_default(
        Capability::ChatWithTools,
        ProviderBinding {
            provider_id: "scripted".into(),
            model_id: "scripted-1".into(),
            config: ModelConfig::new(),
        },
    );

    let registry = tool_registry();
    let runner = AgentRunner::new(
        Arc::new(providers),
        Arc::new(ToolCatalog::new(registry.clone())),
        Arc::new(agents),
    );
    Harness {
        provider,
        registry,
        runner,
    }
}

fn definition(tools: &[&str]) -> AgentDefinition {
    let mut def = AgentDefinition::new("triage", "Triage");
    def.instructions = "Handle the request.".into();
    for tool in tools {
        def.tools.insert((*tool).to_string(), true);
    }
    def
}

// --- Termination & looping ---

#[tokio::test]
async fn test_finishes_when_no_tools_requested() {
    let h = harness(vec![text_response("All sorted.")], AgentRegistry::new());
    let def = definition(&["echo"]);
    let mut run = AgentRun::new(&def);
    run.set_task("help me");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::Solvable);
    assert_eq!(run.answer(), Some("All sorted."));
    assert!(run.is_finished());
    assert_eq!(run.loop_count(), 1);
    assert_eq!(h.provider.call_count(), 1);
    assert_eq!(run.conversation().len(), 2);
    assert_eq!(run.conversation()[0].role, ChatRole::User);
    assert_eq!(run.conversation()[0].text, "help me");
}

#[tokio::test]
async fn test_loop_ceiling_returns_not_solvable() {
    let responses = (0..10)
        .map(|i| tool_response(&format!("call_{i}"), "echo", json!({"text": "again"})))
        .collect();
    let h = harness(responses, AgentRegistry::new());
    let mut def = definition(&["echo"]);
    def.max_loops = 3;
    let mut run = AgentRun::new(&def);
    run.set_task("never finishes");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::NotSolvable);
    assert!(!run.is_finished());
    // The model is called on passes 1..=3; the pass that exceeds the
    // ceiling terminates before calling it.
    assert_eq!(h.provider.call_count(), 3);
    assert_eq!(run.loop_count(), 4);
    assert_eq!(run.pending_tools().len(), 1);
}

#[tokio::test]
async fn test_tool_result_fed_back_to_model() {
    let h = harness(
        vec![
            tool_response("call_1", "echo", json!({"text": "hi there"})),
            text_response("Echoed."),
        ],
        AgentRegistry::new(),
    );
    let def = definition(&["echo"]);
    let mut run = AgentRun::new(&def);
    run.set_task("echo something");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::Solvable);

    let results = run.tool_results(false);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].readable_output(), "hi there");

    let tool_turn = run
        .conversation()
        .iter()
        .find(|t| t.role == ChatRole::Tool)
        .unwrap();
    assert_eq!(tool_turn.text, "hi there");
    assert_eq!(tool_turn.tool_call_id.as_deref(), Some("call_1"));

    // The second round trip carries the grown conversation.
    let calls = h.provider.calls();
    assert!(calls[1].turns > calls[0].turns);
}

#[tokio::test]
async fn test_looping_disabled_leaves_requests_pending() {
    let h = harness(
        vec![tool_response("call_1", "echo", json!({"text": "later"}))],
        AgentRegistry::new(),
    );
    let mut def = definition(&["echo"]);
    def.looping_enabled = false;
    let mut run = AgentRun::new(&def);
    run.set_task("defer to caller");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::Solvable);
    assert_eq!(run.answer(), Some("Using a tool."));
    assert!(!run.is_finished());
    assert_eq!(run.pending_tools().len(), 1);
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn test_provider_failure_is_fatal() {
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(BrokenProvider));
    providers.set_default(
        Capability::ChatWithTools,
        ProviderBinding {
            provider_id: "scripted".into(),
            model_id: "scripted-1".into(),
            config: ModelConfig::new(),
        },
    );
    let runner = AgentRunner::new(
        Arc::new(providers),
        Arc::new(ToolCatalog::new(tool_registry())),
        Arc::new(AgentRegistry::new()),
    );

    let def = definition(&["echo"]);
    let mut run = AgentRun::new(&def);
    run.set_task("anything");

    let err = runner.determine_solvability(&def, &mut run).await.unwrap_err();
    assert!(matches!(err, HelmsmanError::Provider(_)));
}

// --- Return-directly ---

#[tokio::test]
async fn test_return_directly_skips_model_call() {
    let h = harness(
        vec![tool_response("call_1", "echo", json!({"text": "the answer"}))],
        AgentRegistry::new(),
    );
    let mut def = definition(&["echo"]);
    def.tool_settings.insert(
        "echo".into(),
        ToolSettings {
            return_directly: true,
            overrides: None,
        },
    );
    let mut run = AgentRun::new(&def);
    run.set_task("short circuit");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::Solvable);
    assert_eq!(run.answer(), Some("the answer"));
    assert!(run.is_finished());
    // One call to request the tool; none after it returned directly.
    assert_eq!(h.provider.call_count(), 1);
}

// --- Usage limits ---

#[tokio::test]
async fn test_hidden_forced_property_applied_at_execution() {
    let h = harness(
        vec![
            tool_response("call_1", "publisher", json!({"status": "draft"})),
            text_response("Published."),
        ],
        AgentRegistry::new(),
    );
    let mut def = definition(&["publisher"]);
    def.tool_usage_limits = UsageLimits::from([(
        "publisher".to_string(),
        BTreeMap::from([(
            "bundle".to_string(),
            UsageLimit {
                action: UsageLimitAction::ForceValue,
                values: vec!["article".into()],
                hide_property: true,
            },
        )]),
    )]);
    let mut run = AgentRun::new(&def);
    run.set_task("publish it");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::Solvable);

    // The model never saw the hidden property...
    let schema = h.provider.calls()[0]
        .schemas
        .iter()
        .find(|s| s.name == "publisher")
        .cloned()
        .unwrap();
    assert!(schema.parameters["properties"].get("bundle").is_none());

    // ...but the forced value applied when the tool ran.
    let results = run.tool_results_by_plugin_id("publisher", false);
    assert_eq!(results[0].arguments["bundle"], "article");
    assert_eq!(results[0].readable_output(), "published article as draft");
}

#[tokio::test]
async fn test_only_allow_rejects_other_values() {
    let h = harness(
        vec![
            tool_response("call_1", "publisher", json!({"status": "archived", "bundle": "page"})),
            text_response("Understood."),
        ],
        AgentRegistry::new(),
    );
    let mut def = definition(&["publisher"]);
    def.tool_usage_limits = UsageLimits::from([(
        "publisher".to_string(),
        BTreeMap::from([(
            "status".to_string(),
            UsageLimit {
                action: UsageLimitAction::OnlyAllow,
                values: vec!["draft".into(), "published".into()],
                hide_property: false,
            },
        )]),
    )]);
    let mut run = AgentRun::new(&def);
    run.set_task("publish it");

    h.runner.determine_solvability(&def, &mut run).await.unwrap();
    let results = run.tool_results_by_plugin_id("publisher", false);
    assert!(results[0].readable_output().contains("not allowed"));
}

// --- Failure recovery ---

#[tokio::test]
async fn test_unknown_enabled_tool_dropped_each_pass() {
    let responses = (0..10)
        .map(|i| tool_response(&format!("call_{i}"), "echo", json!({"text": "again"})))
        .collect();
    let h = harness(responses, AgentRegistry::new());
    let mut def = definition(&["echo", "ghost"]);
    def.max_loops = 3;
    let mut run = AgentRun::new(&def);
    run.set_task("keep going");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::NotSolvable);
    assert_eq!(h.provider.call_count(), 3);
    for call in h.provider.calls() {
        assert_eq!(call.tool_names, vec!["echo".to_string()]);
    }
}

#[tokio::test]
async fn test_unknown_requested_tool_reports_unknown() {
    let h = harness(
        vec![
            tool_response("call_1", "ghost", json!({})),
            text_response("Moving on."),
        ],
        AgentRegistry::new(),
    );
    let def = definition(&["echo"]);
    let mut run = AgentRun::new(&def);
    run.set_task("try a ghost");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::Solvable);
    let results = run.tool_results(false);
    assert_eq!(results[0].readable_output(), "Unknown tool: ghost");
}

#[tokio::test]
async fn test_validation_failure_becomes_result_text() {
    let h = harness(
        vec![
            tool_response("call_1", "strict", json!({})),
            text_response("Noted."),
        ],
        AgentRegistry::new(),
    );
    let def = definition(&["strict"]);
    let mut run = AgentRun::new(&def);
    run.set_task("query badly");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::Solvable);
    assert_eq!(h.provider.call_count(), 2);
    let results = run.tool_results(false);
    assert!(results[0].readable_output().contains("q is required"));
}

#[tokio::test]
async fn test_execution_error_sanitized_and_recovered() {
    let h = harness(
        vec![
            tool_response("call_1", "failing", json!({})),
            text_response("Shrug."),
        ],
        AgentRegistry::new(),
    );
    let def = definition(&["failing"]);
    let mut run = AgentRun::new(&def);
    run.set_task("break something");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::Solvable);
    assert_eq!(h.provider.call_count(), 2);
    let results = run.tool_results(false);
    assert_eq!(results[0].readable_output(), "boom");
}

// --- Sub-agents ---

fn nested_agents() -> AgentRegistry {
    let mut agents = AgentRegistry::new();

    let mut archivist = AgentDefinition::new("archivist", "Archivist");
    archivist.instructions = "Dig through the archive.".into();
    archivist.tools.insert("marker".into(), true);
    agents.register(archivist);

    let mut researcher = AgentDefinition::new("researcher", "Researcher");
    researcher.instructions = "Delegate to the archivist.".into();
    researcher.tools.insert("archivist".into(), true);
    agents.register(researcher);

    agents
}

#[tokio::test]
async fn test_nested_sub_agents_flatten_recursively() {
    let h = harness(
        vec![
            tool_response("call_p", "researcher", json!({"prompt": "find the ledger"})),
            tool_response("call_r", "archivist", json!({"prompt": "dig deeper"})),
            tool_response("call_a", "marker", json!({})),
            text_response("marker done"),
            text_response("archivist done"),
            text_response("all done"),
        ],
        nested_agents(),
    );
    let def = definition(&["researcher"]);
    let mut run = AgentRun::new(&def);
    run.set_task("find the ledger");

    let outcome = h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(outcome, Solvability::Solvable);
    assert_eq!(run.answer(), Some("all done"));
    assert_eq!(h.provider.call_count(), 6);

    // Non-recursive: only the direct wrapper entry.
    let direct = run.tool_results(false);
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].plugin_id, "researcher");
    assert!(direct[0].is_sub_agent());
    assert_eq!(direct[0].readable_output(), "archivist done");

    // Recursive: wrapper, nested wrapper, and the leaf marker.
    let recursive = run.tool_results(true);
    assert_eq!(recursive.len(), 3);

    assert_eq!(run.tool_results_by_plugin_id("marker", true).len(), 1);
    assert!(run.tool_results_by_plugin_id("marker", false).is_empty());
    assert_eq!(run.tool_results_by_tool::<MarkerTool>(true).len(), 1);
    assert!(run.tool_results_by_tool::<MarkerTool>(false).is_empty());

    // The child keeps its own loop counter.
    let child = direct[0].sub_run().unwrap();
    assert_eq!(child.loop_count(), 2);
    assert!(child.is_finished());
}

#[tokio::test]
async fn test_child_overrides_restrict_inherited_tools() {
    let mut agents = AgentRegistry::new();
    let mut researcher = AgentDefinition::new("researcher", "Researcher");
    researcher.tools.insert("echo".into(), true);
    researcher.tools.insert("marker".into(), true);
    agents.register(researcher);

    let h = harness(
        vec![
            tool_response("call_p", "researcher", json!({"prompt": "restricted task"})),
            text_response("child done"),
            text_response("parent done"),
        ],
        agents,
    );
    let mut def = definition(&["researcher"]);
    def.tool_settings.insert(
        "researcher".into(),
        ToolSettings {
            return_directly: false,
            overrides: Some(ToolOverrides {
                tools: Some(BTreeMap::from([("echo".to_string(), true)])),
                usage_limits: None,
                return_directly: None,
            }),
        },
    );
    let mut run = AgentRun::new(&def);
    run.set_task("delegate with restrictions");

    h.runner.determine_solvability(&def, &mut run).await.unwrap();

    // The child's round trip exposed only the overridden tool set.
    let calls = h.provider.calls();
    assert_eq!(calls[1].tool_names, vec!["echo".to_string()]);
}

// --- Prompt ---

#[tokio::test]
async fn test_system_prompt_falls_back_to_instructions() {
    let h = harness(vec![text_response("ok")], AgentRegistry::new());
    let def = definition(&[]);
    let mut run = AgentRun::new(&def);
    run.set_task("anything");

    h.runner.determine_solvability(&def, &mut run).await.unwrap();
    let prompt = &h.provider.calls()[0].system_prompt;
    assert!(prompt.contains("Handle the request."));
    assert!(prompt.contains("first attempt"));
}

#[tokio::test]
async fn test_information_tools_fold_into_prompt_and_conversation() {
    let h = harness(
        vec![
            tool_response("call_1", "marker", json!({})),
            text_response("ok"),
        ],
        AgentRegistry::new(),
    );
    let mut def = definition(&["marker"]);
    def.default_information_tools = Some(
        "- label: Site facts\n  tool: echo\n  arguments:\n    text: \"facts for [current_user:name]\"\n- label: Later context\n  tool: echo\n  arguments:\n    text: second-pass context\n  loops: [2]\n"
            .into(),
    );
    let mut run = AgentRun::new(&def);
    run.set_task("use the facts");
    run.token_context_mut()
        .insert("current_user:name".into(), "ada".into());

    h.runner.determine_solvability(&def, &mut run).await.unwrap();

    let calls = h.provider.calls();
    // Unrestricted entry lands in the prompt on every pass, tokens
    // substituted.
    assert!(calls[0].system_prompt.contains("--- Site facts ---"));
    assert!(calls[0].system_prompt.contains("facts for ada"));
    assert!(calls[1].system_prompt.contains("--- Site facts ---"));
    // Loop-gated entry shows up as a user turn on pass two only.
    assert!(!calls[0].system_prompt.contains("second-pass context"));
    let gated: Vec<_> = run
        .conversation()
        .iter()
        .filter(|t| t.role == ChatRole::User && t.text == "second-pass context")
        .collect();
    assert_eq!(gated.len(), 1);
}

// --- Snapshot ---

#[tokio::test]
async fn test_snapshot_round_trip_after_run() {
    let h = harness(
        vec![
            tool_response("call_1", "echo", json!({"text": "hi there"})),
            text_response("Echoed."),
        ],
        AgentRegistry::new(),
    );
    let def = definition(&["echo"]);
    let mut run = AgentRun::new(&def);
    run.set_task("echo something");
    run.token_context_mut().insert("site:name".into(), "demo".into());

    h.runner.determine_solvability(&def, &mut run).await.unwrap();

    let snapshot = RunSnapshot::capture(&run);
    let encoded = serde_json::to_string(&snapshot).unwrap();
    let decoded: RunSnapshot = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, snapshot);

    let restored = decoded.restore(&h.registry);
    assert_eq!(restored.conversation(), run.conversation());
    assert_eq!(restored.loop_count(), run.loop_count());
    assert_eq!(restored.is_finished(), run.is_finished());
    assert_eq!(restored.token_context(), run.token_context());
    assert_eq!(RunSnapshot::capture(&restored), snapshot);
}

#[tokio::test]
async fn test_snapshot_resume_continues_pending_tools() {
    let h = harness(
        vec![tool_response("call_1", "echo", json!({"text": "resumed"}))],
        AgentRegistry::new(),
    );
    let mut def = definition(&["echo"]);
    def.looping_enabled = false;
    let mut run = AgentRun::new(&def);
    run.set_task("pause here");

    h.runner.determine_solvability(&def, &mut run).await.unwrap();
    assert_eq!(run.pending_tools().len(), 1);

    // Persist, drop, restore in a "new request".
    let record = serde_json::to_value(RunSnapshot::capture(&run)).unwrap();
    let snapshot: RunSnapshot = serde_json::from_value(record).unwrap();
    let mut restored = snapshot.restore(&h.registry);
    assert_eq!(restored.pending_tools().len(), 1);
    assert_eq!(restored.pending_tools()[0].tool_call_id, "call_1");

    let h2 = harness(vec![text_response("Resumed fine.")], AgentRegistry::new());
    let outcome = h2
        .runner
        .determine_solvability(&def, &mut restored)
        .await
        .unwrap();
    assert_eq!(outcome, Solvability::Solvable);
    assert_eq!(restored.answer(), Some("Resumed fine."));

    // The pending call ran exactly once, on resume.
    let results = restored.tool_results_by_plugin_id("echo", false);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].readable_output(), "resumed");
}

#[tokio::test]
async fn test_nested_snapshot_round_trip() {
    let h = harness(
        vec![
            tool_response("call_p", "researcher", json!({"prompt": "find the ledger"})),
            tool_response("call_r", "archivist", json!({"prompt": "dig deeper"})),
            tool_response("call_a", "marker", json!({})),
            text_response("marker done"),
            text_response("archivist done"),
            text_response("all done"),
        ],
        nested_agents(),
    );
    let def = definition(&["researcher"]);
    let mut run = AgentRun::new(&def);
    run.set_task("find the ledger");

    h.runner.determine_solvability(&def, &mut run).await.unwrap();

    let snapshot = RunSnapshot::capture(&run);
    let wrapper = &snapshot.completed_tools[0];
    assert!(wrapper.sub_run.is_some());

    let restored = snapshot.restore(&h.registry);
    assert_eq!(RunSnapshot::capture(&restored), snapshot);

    // Restoration re-attached the nested results without executing
    // anything.
    assert_eq!(restored.tool_results_by_plugin_id("marker", true).len(), 1);
    assert_eq!(
        restored.tool_results_by_plugin_id("marker", true)[0].readable_output(),
        "marked"
    );
}
