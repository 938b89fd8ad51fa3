//! System prompt builder for the run loop.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use helmsman_core::config::{AgentDefinition, InformationToolConfig};
use helmsman_core::tokens::{TokenContext, TokenReplacer};
use helmsman_core::types::ChatTurn;
use helmsman_tools::{ToolCatalog, ToolContext};

use crate::run::AgentRun;

/// Placeholder substituted with the agent's user-editable instructions.
pub const AGENT_INSTRUCTIONS_TOKEN: &str = "[agent:instructions]";

/// Extension point run on every pass, before token substitution. Hooks
/// may rewrite the prompt text and inject or override token values.
pub trait PromptHook: Send + Sync {
    fn before_substitution(&self, run: &AgentRun, prompt: &mut String, tokens: &mut TokenContext);
}

/// The prompt for one pass plus any loop-gated context turns.
#[derive(Debug, Default)]
pub struct BuiltPrompt {
    pub system_prompt: String,
    /// Information-tool output restricted to specific loop counts lands
    /// in the conversation instead of the prompt.
    pub extra_turns: Vec<ChatTurn>,
}

/// Build the system prompt for the current pass.
pub async fn build_system_prompt(
    definition: &AgentDefinition,
    run: &AgentRun,
    catalog: &ToolCatalog,
    replacer: &dyn TokenReplacer,
    hooks: &[Arc<dyn PromptHook>],
) -> BuiltPrompt {
    let mut prompt = if definition.secured_prompt.trim().is_empty() {
        AGENT_INSTRUCTIONS_TOKEN.to_string()
    } else {
        definition.secured_prompt.clone()
    };

    prompt.push_str(&format!(
        "\n\nThis is the {} attempt at solving the task.",
        ordinal(run.loop_count())
    ));

    let mut tokens = run.token_context().clone();
    tokens.insert("agent:id".into(), definition.id.clone());
    tokens.insert("agent:label".into(), definition.label.clone());
    tokens.insert("agent:instructions".into(), definition.instructions.clone());

    let mut extra_turns = Vec::new();
    for info in definition.information_tools() {
        let in_prompt = info.loops.is_empty();
        if !in_prompt && !info.loops.contains(&run.loop_count()) {
            continue;
        }
        let Some(output) = run_information_tool(catalog, replacer, run, &tokens, &info).await else {
            continue;
        };
        if in_prompt {
            prompt.push_str(&format!("\n\n--- {} ---\n{}", info.label, output));
        } else {
            extra_turns.push(ChatTurn::user(output));
        }
    }

    for hook in hooks {
        hook.before_substitution(run, &mut prompt, &mut tokens);
    }

    BuiltPrompt {
        system_prompt: replacer.replace(&prompt, &tokens),
        extra_turns,
    }
}

/// Execute one pre-configured information tool. Failure of optional
/// enrichment never fails the prompt build.
async fn run_information_tool(
    catalog: &ToolCatalog,
    replacer: &dyn TokenReplacer,
    run: &AgentRun,
    tokens: &TokenContext,
    info: &InformationToolConfig,
) -> Option<String> {
    let Some(mut tool) = catalog.instantiate(&info.tool) else {
        warn!(tool = %info.tool, "Information tool no longer resolves, skipping");
        return None;
    };

    let mut arguments = serde_json::Map::new();
    for (key, value) in &info.arguments {
        let value = match value {
            Value::String(text) => Value::String(replacer.replace(text, tokens)),
            other => other.clone(),
        };
        arguments.insert(key.clone(), value);
    }

    let context = ToolContext {
        run_id: run.runner_id().to_string(),
        tokens: tokens.clone(),
    };
    match tool.execute(&Value::Object(arguments), &context).await {
        Ok(()) => Some(tool.readable_output()),
        Err(e) => {
            warn!(tool = %info.tool, error = %e, "Information tool failed, skipping");
            None
        }
    }
}

/// Ordinal phrasing for loop counts: words up to three, numeric beyond.
pub fn ordinal(n: u32) -> String {
    match n {
        1 => "first".into(),
        2 => "second".into(),
        3 => "third".into(),
        n => format!("{n}th"),
    }
}
