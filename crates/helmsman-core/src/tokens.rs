//! Token substitution — ambient variables folded into prompt text and
//! usage-limit values.

use std::collections::BTreeMap;

/// Ambient substitution variables for a run. Caller-seeded, agent-augmented.
pub type TokenContext = BTreeMap<String, String>;

/// Replaces named placeholders in text. The concrete token syntax and the
/// fate of unresolved tokens belong to the implementation.
pub trait TokenReplacer: Send + Sync {
    fn replace(&self, text: &str, context: &TokenContext) -> String;
}

/// Default replacer: substitutes `[key]` occurrences from the context and
/// leaves unresolved tokens in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct BracketReplacer;

impl TokenReplacer for BracketReplacer {
    fn replace(&self, text: &str, context: &TokenContext) -> String {
        let mut out = text.to_string();
        for (key, value) in context {
            let needle = format!("[{key}]");
            if out.contains(&needle) {
                out = out.replace(&needle, value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaces_known_tokens() {
        let mut context = TokenContext::new();
        context.insert("agent:label".into(), "Scheduler".into());
        context.insert("current_user:name".into(), "ada".into());

        let out = BracketReplacer.replace("[agent:label] acting for [current_user:name]", &context);
        assert_eq!(out, "Scheduler acting for ada");
    }

    #[test]
    fn test_unresolved_tokens_left_as_is() {
        let context = TokenContext::new();
        let out = BracketReplacer.replace("hello [missing:token]", &context);
        assert_eq!(out, "hello [missing:token]");
    }
}
