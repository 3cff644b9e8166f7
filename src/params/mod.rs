// Parameter management for workflow tools
//
// Resolves the effective configuration of each tool invocation from the
// tool's generated defaults plus the persisted overrides in `params.json`.
// Only values that differ from their default are written, so a defaults
// change in a newer tool version takes effect for untouched parameters.

pub mod defaults;
pub mod presets;
pub mod registry;

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ParameterError;
use crate::workflow::layout::WorkflowDir;
use defaults::{values_equal, ToolDefaults};
use presets::Preset;
use registry::ToolRegistry;

/// Field linking a persisted instance entry back to its tool
pub const TOOL_NAME_KEY: &str = "_tool_name";

/// Persisted overrides of one tool or instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOverrides {
    /// Owning tool when the entry belongs to an instance
    pub tool_name: Option<String>,
    pub values: BTreeMap<String, Value>,
}

/// Contents of `params.json`: general scalars at the top level, one object
/// per tool or instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    pub general: BTreeMap<String, Value>,
    pub tools: BTreeMap<String, ToolOverrides>,
}

impl ParameterSet {
    pub fn from_json(value: Value) -> Option<Self> {
        let Value::Object(map) = value else {
            return None;
        };
        let mut set = ParameterSet::default();
        for (key, value) in map {
            match value {
                Value::Object(fields) => {
                    let mut overrides = ToolOverrides::default();
                    for (param, value) in fields {
                        if param == TOOL_NAME_KEY {
                            overrides.tool_name = value.as_str().map(String::from);
                        } else {
                            overrides.values.insert(param, value);
                        }
                    }
                    set.tools.insert(key, overrides);
                }
                other => {
                    set.general.insert(key, other);
                }
            }
        }
        Some(set)
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.general {
            map.insert(key.clone(), value.clone());
        }
        for (key, overrides) in &self.tools {
            let mut fields = Map::new();
            if let Some(tool) = &overrides.tool_name {
                fields.insert(TOOL_NAME_KEY.to_string(), Value::String(tool.clone()));
            }
            for (param, value) in &overrides.values {
                fields.insert(param.clone(), value.clone());
            }
            map.insert(key.clone(), Value::Object(fields));
        }
        Value::Object(map)
    }

    /// Overrides of one tool or instance, empty when none are stored
    pub fn overrides(&self, key: &str) -> BTreeMap<String, Value> {
        self.tools
            .get(key)
            .map(|entry| entry.values.clone())
            .unwrap_or_default()
    }
}

/// A batch of edited values to persist
#[derive(Debug, Clone, Default)]
pub struct ParameterUpdate {
    pub general: BTreeMap<String, Value>,
    pub tools: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ParameterUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn general(mut self, key: &str, value: Value) -> Self {
        self.general.insert(key.to_string(), value);
        self
    }

    /// Set `param` of a tool or instance
    pub fn tool(mut self, key: &str, param: &str, value: Value) -> Self {
        self.tools
            .entry(key.to_string())
            .or_default()
            .insert(param.to_string(), value);
        self
    }
}

/// Boolean-like strings become booleans
fn normalize(value: Value) -> Value {
    match value {
        Value::String(s) if s.eq_ignore_ascii_case("true") => Value::Bool(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Value::Bool(false),
        other => other,
    }
}

/// Parameter storage of one workflow directory
#[derive(Debug)]
pub struct ParameterManager {
    layout: WorkflowDir,
    presets_file: PathBuf,
    registry: Mutex<ToolRegistry>,
    warned_malformed: AtomicBool,
}

impl ParameterManager {
    /// Open the parameter store, creating the configuration directory and
    /// picking up instances recorded in `params.json`
    pub fn new(layout: &WorkflowDir, presets_file: &Path) -> Result<Self, ParameterError> {
        std::fs::create_dir_all(layout.ini_dir()).map_err(|source| ParameterError::Io {
            path: layout.ini_dir(),
            source,
        })?;

        let manager = Self {
            layout: layout.clone(),
            presets_file: presets_file.to_path_buf(),
            registry: Mutex::new(ToolRegistry::new()),
            warned_malformed: AtomicBool::new(false),
        };

        let stored = manager.load();
        {
            let mut registry = manager.registry();
            for (key, entry) in &stored.tools {
                if let Some(tool) = &entry.tool_name {
                    if let Err(e) = registry.register_instance(tool, key) {
                        tracing::warn!("Ignoring stored instance `{}`: {}", key, e);
                    }
                }
            }
        }

        Ok(manager)
    }

    fn registry(&self) -> MutexGuard<'_, ToolRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn layout(&self) -> &WorkflowDir {
        &self.layout
    }

    /// Tool a configuration key (tool id or instance name) refers to
    pub fn tool_for(&self, key: &str) -> String {
        self.registry().tool_for(key).to_string()
    }

    /// Register a named instance of `tool` and record its back-reference so
    /// it survives a reload
    pub fn register_instance(&self, tool: &str, instance: &str) -> Result<(), ParameterError> {
        self.registry()
            .register_instance(tool, instance)
            .map_err(|reason| ParameterError::InvalidInstance {
                instance: instance.to_string(),
                reason,
            })?;

        if instance == tool {
            return Ok(());
        }

        let mut stored = self.load();
        let entry = stored.tools.entry(instance.to_string()).or_default();
        if entry.tool_name.as_deref() == Some(tool) {
            return Ok(());
        }
        entry.tool_name = Some(tool.to_string());
        self.write(&stored)
    }

    /// Make sure the defaults of `tool` exist, generating the descriptor by
    /// running `<tool> -write_ini <path>` when missing
    pub async fn ensure_defaults(&self, tool: &str) -> Result<Arc<ToolDefaults>, ParameterError> {
        if let Some(defaults) = self.registry().defaults(tool) {
            return Ok(defaults);
        }

        let ini_path = self.layout.ini_file(tool);
        if !ini_path.exists() {
            tracing::info!("Generating defaults for {} at {:?}", tool, ini_path);
            let output = tokio::process::Command::new(tool)
                .arg("-write_ini")
                .arg(&ini_path)
                .stdin(std::process::Stdio::null())
                .output()
                .await
                .map_err(|e| ParameterError::MissingDefaults {
                    tool: tool.to_string(),
                    reason: e.to_string(),
                })?;

            if !output.status.success() || !ini_path.exists() {
                return Err(ParameterError::MissingDefaults {
                    tool: tool.to_string(),
                    reason: format!(
                        "`{} -write_ini` exited with {}: {}",
                        tool,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
        }

        let defaults = ToolDefaults::load(tool, &ini_path)?;
        Ok(self.registry().set_defaults(defaults))
    }

    /// Persisted parameters. A malformed file is reported once and treated
    /// as empty.
    pub fn load(&self) -> ParameterSet {
        let path = self.layout.params_file();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => return ParameterSet::default(),
        };

        let parsed = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(ParameterSet::from_json);
        match parsed {
            Some(set) => set,
            None => {
                if !self.warned_malformed.swap(true, Ordering::Relaxed) {
                    tracing::error!(
                        "Invalid parameter file {:?}, falling back to defaults",
                        path
                    );
                }
                ParameterSet::default()
            }
        }
    }

    /// Merge `update` into the persisted parameters and return the result.
    ///
    /// A tool value is written when it differs from its default, when the
    /// key was already persisted, or when it is an empty list. Values
    /// without a documented default are always written.
    pub async fn save(&self, update: ParameterUpdate) -> Result<ParameterSet, ParameterError> {
        let mut resolved_defaults = BTreeMap::new();
        for key in update.tools.keys() {
            let tool = self.tool_for(key);
            if !resolved_defaults.contains_key(&tool) {
                let defaults = self.ensure_defaults(&tool).await?;
                resolved_defaults.insert(tool, defaults);
            }
        }

        let mut stored = self.load();

        for (key, value) in update.general {
            stored.general.insert(key, normalize(value));
        }

        for (key, values) in update.tools {
            let tool = self.tool_for(&key);
            let defaults = &resolved_defaults[&tool];
            let entry = stored.tools.entry(key.clone()).or_default();
            if key != tool {
                entry.tool_name = Some(tool.clone());
            }

            for (param, value) in values {
                let value = normalize(value);
                let differs = defaults
                    .default_value(&param)
                    .map_or(true, |default| !values_equal(default, &value));
                let already_stored = entry.values.contains_key(&param);
                let empty_list = matches!(&value, Value::Array(items) if items.is_empty());

                if differs || already_stored || empty_list {
                    entry.values.insert(param, value);
                }
            }
        }

        stored
            .tools
            .retain(|_, entry| entry.tool_name.is_some() || !entry.values.is_empty());

        self.write(&stored)?;
        tracing::debug!("Saved parameters to {:?}", self.layout.params_file());
        Ok(stored)
    }

    /// Persisted overrides of one tool or instance
    pub fn overrides(&self, key: &str) -> BTreeMap<String, Value> {
        self.load().overrides(key)
    }

    /// Effective configuration of one tool or instance: the tool's
    /// defaults with the key's overrides applied
    pub async fn resolve(&self, key: &str) -> Result<BTreeMap<String, Value>, ParameterError> {
        let tool = self.tool_for(key);
        let defaults = self.ensure_defaults(&tool).await?;
        let mut values = defaults.values();
        values.extend(self.overrides(key));
        Ok(values)
    }

    /// Forget every stored override
    pub fn reset(&self) -> Result<(), ParameterError> {
        let path = self.layout.params_file();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ParameterError::Io { path, source }),
        }
    }

    /// Presets defined for this workflow
    pub fn load_presets(&self) -> BTreeMap<String, Preset> {
        presets::load_catalog(&self.presets_file, &self.layout.name())
    }

    pub fn preset_names(&self) -> Vec<String> {
        self.load_presets().into_keys().collect()
    }

    /// Display text of a preset, empty when absent
    pub fn preset_description(&self, name: &str) -> String {
        self.load_presets()
            .remove(name)
            .and_then(|preset| preset.description)
            .unwrap_or_default()
    }

    /// Apply a preset on top of the stored parameters.
    /// Returns `false` when no preset of that name exists.
    pub fn apply_preset(&self, name: &str) -> Result<bool, ParameterError> {
        let Some(preset) = self.load_presets().remove(name) else {
            return Ok(false);
        };

        let mut stored = self.load();
        stored.general.extend(preset.general);
        for (key, values) in preset.tools {
            let tool = self.tool_for(&key);
            let entry = stored.tools.entry(key.clone()).or_default();
            if key != tool {
                entry.tool_name = Some(tool);
            }
            entry.values.extend(values.into_iter().map(|(k, v)| (k, normalize(v))));
        }

        self.write(&stored)?;
        tracing::info!("Applied preset '{}'", name);
        Ok(true)
    }

    fn write(&self, set: &ParameterSet) -> Result<(), ParameterError> {
        let path = self.layout.params_file();
        let bytes = serde_json::to_vec_pretty(&set.to_json())?;
        crate::utils::write_atomic(&path, &bytes).map_err(|source| ParameterError::Io { path, source })
    }
}
