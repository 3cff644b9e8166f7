// Parameter presets
//
// The catalog is a JSON file keyed by workflow directory name, then preset
// name. Inside a preset, `_description` is display text, `_general` holds
// general parameters and every other key is a tool or instance with its
// parameter values.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Key holding a preset's display text
pub const DESCRIPTION_KEY: &str = "_description";
/// Key holding a preset's general parameters
pub const GENERAL_KEY: &str = "_general";

/// A named bundle of parameter values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preset {
    pub description: Option<String>,
    pub general: BTreeMap<String, Value>,
    pub tools: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Preset {
    fn from_json(value: &Map<String, Value>) -> Self {
        let mut preset = Preset::default();
        for (key, entry) in value {
            match (key.as_str(), entry) {
                (DESCRIPTION_KEY, Value::String(text)) => preset.description = Some(text.clone()),
                (GENERAL_KEY, Value::Object(params)) => {
                    preset.general = params.clone().into_iter().collect();
                }
                (name, Value::Object(params)) if !name.starts_with('_') => {
                    preset
                        .tools
                        .insert(name.to_string(), params.clone().into_iter().collect());
                }
                _ => tracing::debug!("Ignoring preset entry `{}`", key),
            }
        }
        preset
    }
}

/// Presets of one workflow, ordered by name.
///
/// A missing catalog, a malformed catalog and a workflow without an entry
/// all yield an empty set.
pub fn load_catalog(path: &Path, workflow: &str) -> BTreeMap<String, Preset> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Cannot read preset catalog {:?}: {}", path, e);
            }
            return BTreeMap::new();
        }
    };

    let catalog: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Ignoring malformed preset catalog {:?}: {}", path, e);
            return BTreeMap::new();
        }
    };

    let Some(Value::Object(workflow_presets)) = catalog.get(workflow) else {
        return BTreeMap::new();
    };

    workflow_presets
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .filter_map(|(name, value)| match value {
            Value::Object(fields) => Some((name.clone(), Preset::from_json(fields))),
            _ => None,
        })
        .collect()
}
