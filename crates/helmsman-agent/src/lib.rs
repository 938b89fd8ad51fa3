//! Agent runtime — bounded tool-calling loop with snapshot suspend/resume.
//!
//! One [`runner::AgentRunner::determine_solvability`] call is one
//! determination: the loop sends the conversation to the bound model,
//! executes the tools it requests (nested agents included), feeds the
//! results back, and terminates either with an answer or with a
//! not-solvable outcome once the loop ceiling is hit. The full mutable
//! state lives in [`run::AgentRun`] and can be persisted between requests
//! via [`snapshot::RunSnapshot`].

pub mod invocation;
pub mod prompt;
pub mod run;
pub mod runner;
pub mod snapshot;

pub use invocation::{ToolInvocation, ToolKind};
pub use prompt::{ordinal, BuiltPrompt, PromptHook, AGENT_INSTRUCTIONS_TOKEN};
pub use run::AgentRun;
pub use runner::{AgentRegistry, AgentRunner, Solvability};
pub use snapshot::{RunSnapshot, ToolInvocationSnapshot};
