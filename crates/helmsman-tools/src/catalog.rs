//! Tool catalog — resolves an agent's enabled tool set into executable
//! instances with usage limits locked into the exposed schemas.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use helmsman_core::config::UsageLimits;
use helmsman_core::tokens::{TokenContext, TokenReplacer};

use crate::limits::{apply_usage_limits, AppliedLimits};
use crate::{Tool, ToolRegistry};

/// Cached per-plugin schema material (description + raw parameter
/// schema), so resolution does not re-instantiate tools just to read
/// their metadata. Owned by the catalog; invalidated explicitly when the
/// registry changes.
#[derive(Default)]
pub struct SchemaCache {
    inner: Mutex<HashMap<String, (String, Value)>>,
}

impl SchemaCache {
    pub fn invalidate(&self) {
        self.inner.lock().expect("schema cache poisoned").clear();
    }

    fn get(&self, plugin_id: &str) -> Option<(String, Value)> {
        self.inner
            .lock()
            .expect("schema cache poisoned")
            .get(plugin_id)
            .cloned()
    }

    fn insert(&self, plugin_id: &str, description: String, schema: Value) {
        self.inner
            .lock()
            .expect("schema cache poisoned")
            .insert(plugin_id.to_string(), (description, schema));
    }
}

/// One enabled tool, ready for a pass: the schema the model sees and the
/// instance plus argument constraints the executor uses.
pub struct ResolvedTool {
    pub plugin_id: String,
    pub description: String,
    pub limits: AppliedLimits,
    pub instance: Box<dyn Tool>,
}

/// Resolves configured tool ids into executable tools for a run.
pub struct ToolCatalog {
    registry: Arc<ToolRegistry>,
    cache: SchemaCache,
}

impl ToolCatalog {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            cache: SchemaCache::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Drop cached schema material, e.g. after registry changes.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    /// Instantiate a fresh executable for a plugin id.
    pub fn instantiate(&self, plugin_id: &str) -> Option<Box<dyn Tool>> {
        self.registry.instantiate(plugin_id)
    }

    /// Resolve the enabled tool set. A plugin id that no longer resolves
    /// is skipped for this pass; resolution of the remaining tools
    /// continues.
    pub fn resolve_enabled_tools(
        &self,
        enabled: &[String],
        usage_limits: &UsageLimits,
        tokens: &TokenContext,
        replacer: &dyn TokenReplacer,
    ) -> BTreeMap<String, ResolvedTool> {
        let mut resolved = BTreeMap::new();

        for plugin_id in enabled {
            let Some(instance) = self.registry.instantiate(plugin_id) else {
                warn!(tool = %plugin_id, "Enabled tool no longer resolves, skipping");
                continue;
            };

            let (description, schema) = match self.cache.get(plugin_id) {
                Some(cached) => cached,
                None => {
                    let description = instance.description().to_string();
                    let schema = instance.parameters_schema();
                    self.cache.insert(plugin_id, description.clone(), schema.clone());
                    (description, schema)
                }
            };

            let property_limits = usage_limits.get(plugin_id);
            let limits = match property_limits {
                Some(map) => apply_usage_limits(&schema, map, tokens, replacer),
                None => AppliedLimits {
                    schema,
                    ..Default::default()
                },
            };

            debug!(tool = %plugin_id, "Resolved tool for pass");
            resolved.insert(
                plugin_id.clone(),
                ResolvedTool {
                    plugin_id: plugin_id.clone(),
                    description,
                    limits,
                    instance,
                },
            );
        }

        resolved
    }
}
