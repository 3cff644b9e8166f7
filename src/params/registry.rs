// Tool registry
//
// Maps tool ids to their parsed defaults and to the named instances that
// share them. An instance is an independently configured use of a tool
// ("IDFilter-strict" and "IDFilter-lenient" both run IDFilter).

use std::collections::BTreeMap;
use std::sync::Arc;

use super::defaults::ToolDefaults;

#[derive(Debug, Clone, Default)]
struct RegisteredTool {
    defaults: Option<Arc<ToolDefaults>>,
    instances: Vec<String>,
}

/// Tool id -> defaults and instances
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
    instance_owner: BTreeMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tool` known without any instance
    pub fn register_tool(&mut self, tool: &str) {
        self.tools.entry(tool.to_string()).or_default();
    }

    /// Register `instance` as a named use of `tool`.
    /// Fails when the name is already bound to a different tool.
    pub fn register_instance(&mut self, tool: &str, instance: &str) -> Result<(), String> {
        if instance == tool {
            self.register_tool(tool);
            return Ok(());
        }
        if self.tools.contains_key(instance) {
            return Err(format!("instance name `{}` is already a tool id", instance));
        }
        if let Some(owner) = self.instance_owner.get(instance) {
            if owner != tool {
                return Err(format!(
                    "instance `{}` already belongs to tool `{}`",
                    instance, owner
                ));
            }
            return Ok(());
        }

        self.instance_owner
            .insert(instance.to_string(), tool.to_string());
        self.tools
            .entry(tool.to_string())
            .or_default()
            .instances
            .push(instance.to_string());
        Ok(())
    }

    /// Tool a configuration key refers to; unknown keys are taken as tool ids
    pub fn tool_for<'a>(&'a self, key: &'a str) -> &'a str {
        self.instance_owner
            .get(key)
            .map(String::as_str)
            .unwrap_or(key)
    }

    pub fn is_instance(&self, key: &str) -> bool {
        self.instance_owner.contains_key(key)
    }

    pub fn instances(&self, tool: &str) -> &[String] {
        self.tools
            .get(tool)
            .map(|t| t.instances.as_slice())
            .unwrap_or(&[])
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn defaults(&self, tool: &str) -> Option<Arc<ToolDefaults>> {
        self.tools.get(tool).and_then(|t| t.defaults.clone())
    }

    pub fn set_defaults(&mut self, defaults: ToolDefaults) -> Arc<ToolDefaults> {
        let defaults = Arc::new(defaults);
        self.tools
            .entry(defaults.tool.clone())
            .or_default()
            .defaults = Some(Arc::clone(&defaults));
        defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_resolve_to_tool() {
        let mut registry = ToolRegistry::new();
        registry.register_instance("IDFilter", "IDFilter-strict").unwrap();
        registry.register_instance("IDFilter", "IDFilter-lenient").unwrap();

        assert_eq!(registry.tool_for("IDFilter-strict"), "IDFilter");
        assert_eq!(registry.tool_for("IDFilter"), "IDFilter");
        assert_eq!(registry.tool_for("FeatureFinder"), "FeatureFinder");
        assert_eq!(registry.instances("IDFilter").len(), 2);
        assert!(registry.is_instance("IDFilter-lenient"));
    }

    #[test]
    fn test_instance_name_conflicts() {
        let mut registry = ToolRegistry::new();
        registry.register_tool("PeakPicker");
        registry.register_instance("IDFilter", "strict").unwrap();

        assert!(registry.register_instance("IDFilter", "strict").is_ok());
        assert!(registry.register_instance("PeakPicker", "strict").is_err());
        assert!(registry.register_instance("IDFilter", "PeakPicker").is_err());
    }

    #[test]
    fn test_defaults_are_shared() {
        let mut registry = ToolRegistry::new();
        registry.register_instance("IDFilter", "strict").unwrap();
        assert!(registry.defaults("IDFilter").is_none());

        registry.set_defaults(ToolDefaults {
            tool: "IDFilter".to_string(),
            entries: Default::default(),
        });
        let tool = registry.tool_for("strict").to_string();
        assert!(registry.defaults(&tool).is_some());
    }
}
