//! Usage-limit application — locking forced and allowed property values
//! into a tool schema before it is exposed to the model.

use std::collections::BTreeMap;

use serde_json::Value;

use helmsman_core::config::{UsageLimit, UsageLimitAction};
use helmsman_core::tokens::{TokenContext, TokenReplacer};

/// A schema with limits applied, plus the argument constraints the
/// executor enforces at call time.
#[derive(Debug, Clone, Default)]
pub struct AppliedLimits {
    /// The schema as exposed to the model. Hidden forced properties are
    /// absent here even though their values apply at execution.
    pub schema: Value,
    /// Property values fixed regardless of what the model sends.
    pub forced: BTreeMap<String, Value>,
    /// Properties restricted to an allowed value set.
    pub allowed: BTreeMap<String, Vec<String>>,
}

/// Apply per-property usage limits to a parameter schema. Token
/// placeholders in limit values are substituted before the values are
/// locked in.
pub fn apply_usage_limits(
    schema: &Value,
    limits: &BTreeMap<String, UsageLimit>,
    tokens: &TokenContext,
    replacer: &dyn TokenReplacer,
) -> AppliedLimits {
    let mut applied = AppliedLimits {
        schema: schema.clone(),
        ..Default::default()
    };

    for (property, limit) in limits {
        match limit.action {
            UsageLimitAction::None => {}
            UsageLimitAction::OnlyAllow => {
                if limit.values.is_empty() {
                    continue;
                }
                let values: Vec<String> = limit
                    .values
                    .iter()
                    .map(|v| replacer.replace(v, tokens))
                    .collect();
                if let Some(prop) = property_schema(&mut applied.schema, property) {
                    prop["enum"] = Value::Array(
                        values.iter().map(|v| Value::String(v.clone())).collect(),
                    );
                }
                applied.allowed.insert(property.clone(), values);
            }
            UsageLimitAction::ForceValue => {
                let Some(raw) = limit.values.first() else {
                    continue;
                };
                let value = replacer.replace(raw, tokens);
                applied
                    .forced
                    .insert(property.clone(), Value::String(value.clone()));

                // A fixed property is never required of the model.
                remove_required(&mut applied.schema, property);
                if limit.hide_property {
                    if let Some(props) = applied
                        .schema
                        .get_mut("properties")
                        .and_then(Value::as_object_mut)
                    {
                        props.remove(property);
                    }
                } else if let Some(prop) = property_schema(&mut applied.schema, property) {
                    prop["const"] = Value::String(value);
                }
            }
        }
    }

    applied
}

/// Merge forced values over the model-supplied arguments and check the
/// allowed sets. Returns the per-property messages for any disallowed
/// values.
pub fn constrain_arguments(
    arguments: &mut Value,
    applied: &AppliedLimits,
) -> Vec<(String, String)> {
    if !arguments.is_object() {
        *arguments = Value::Object(serde_json::Map::new());
    }
    let Some(map) = arguments.as_object_mut() else {
        return Vec::new();
    };

    for (property, value) in &applied.forced {
        map.insert(property.clone(), value.clone());
    }

    let mut violations = Vec::new();
    for (property, allowed) in &applied.allowed {
        let Some(value) = map.get(property) else {
            continue;
        };
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !allowed.contains(&text) {
            violations.push((
                property.clone(),
                format!("Value \"{text}\" is not allowed for {property}."),
            ));
        }
    }
    violations
}

fn property_schema<'a>(schema: &'a mut Value, property: &str) -> Option<&'a mut Value> {
    schema
        .get_mut("properties")
        .and_then(Value::as_object_mut)
        .and_then(|props| props.get_mut(property))
}

fn remove_required(schema: &mut Value, property: &str) {
    if let Some(required) = schema.get_mut("required").and_then(Value::as_array_mut) {
        required.retain(|v| v.as_str() != Some(property));
    }
}
