// Workflow definitions
//
// A workflow is an ordered list of tool steps described in YAML. Each step
// binds tool arguments to files: taken from a general parameter, listed
// literally, or derived from an earlier argument by rewriting its type and
// location.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::config::ValidationResult;
use crate::error::DefinitionError;

/// Complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Display name
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Steps, run in order
    pub steps: Vec<StepDefinition>,
}

/// One tool run within a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Executable to run, or the script file when `interpreter` is set
    pub tool: String,
    /// Run `tool` as a script with this interpreter (e.g. `python3`)
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Named instance whose parameters apply
    #[serde(default)]
    pub instance: Option<String>,
    /// File arguments, in command-line order
    #[serde(default)]
    pub args: Vec<ArgumentBinding>,
    /// Extra flags appended after the stored parameters
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Keep going when the tool fails
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub cache: Option<CacheDirective>,
}

impl StepDefinition {
    /// Label used in logs and progress reports
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Key under which this step's parameters are stored
    pub fn parameter_key(&self) -> &str {
        self.instance.as_deref().unwrap_or(&self.tool)
    }
}

/// Where the files of one argument come from
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgumentBinding {
    /// Flag name, without the leading dash
    pub name: String,
    /// General parameter holding one path or a list of paths
    pub param: Option<String>,
    /// Literal files or directories
    pub files: Option<Vec<String>>,
    /// Derive from `arg` of this step, or from `step.arg` of an earlier one
    pub like: Option<String>,
    /// New file extension of the derived files
    pub file_type: Option<String>,
    /// Results subdirectory, `auto` for a generated name
    pub results_dir: Option<String>,
    /// Pass every file in a single invocation
    pub collect: bool,
}

/// Reference to a resolved argument
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgRef<'a> {
    /// `None` for the step that holds the reference
    pub step: Option<&'a str>,
    pub arg: &'a str,
}

impl ArgumentBinding {
    fn source_count(&self) -> usize {
        [self.param.is_some(), self.files.is_some(), self.like.is_some()]
            .iter()
            .filter(|set| **set)
            .count()
    }

    /// The argument this binding is derived from
    pub fn like_ref(&self) -> Option<ArgRef<'_>> {
        self.like.as_deref().map(|like| match like.split_once('.') {
            Some((step, arg)) => ArgRef {
                step: Some(step),
                arg,
            },
            None => ArgRef { step: None, arg: like },
        })
    }
}

/// Store produced files in the result cache after a step succeeds.
///
/// File `i` of `file_from` is stored under the stem of file `i` of
/// `dataset_from` (the only file when that argument has one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDirective {
    pub tag: String,
    /// Argument holding the produced files
    pub file_from: String,
    /// Argument whose file stems name the datasets
    pub dataset_from: String,
}

impl WorkflowDefinition {
    /// Load and validate a definition file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let definition: WorkflowDefinition =
            serde_yaml::from_str(&content).map_err(|source| DefinitionError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let validation = definition.validate();
        for warning in &validation.warnings {
            tracing::warn!("{}: {}", path.display(), warning);
        }
        if !validation.is_valid {
            return Err(DefinitionError::Invalid(validation.errors.join("; ")));
        }
        Ok(definition)
    }

    /// Check step ids, binding sources and references
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.name.trim().is_empty() {
            result.add_error("Workflow name cannot be empty".to_string());
        }
        if self.steps.is_empty() {
            result.add_error("Workflow must have at least one step".to_string());
        }

        // step id -> its argument names
        let mut seen: HashMap<&str, HashSet<&str>> = HashMap::new();

        for step in &self.steps {
            if step.id.is_empty() {
                result.add_error("Step ID cannot be empty".to_string());
            } else if seen.contains_key(step.id.as_str()) {
                result.add_error(format!("Duplicate step ID: {}", step.id));
            }
            if step.tool.trim().is_empty() {
                result.add_error(format!("Step '{}' has no tool", step.id));
            }
            if step.interpreter.as_deref().is_some_and(|i| i.trim().is_empty()) {
                result.add_error(format!("Step '{}' has an empty interpreter", step.id));
            }

            let mut own_args: HashSet<&str> = HashSet::new();
            for binding in &step.args {
                if binding.name.is_empty() {
                    result.add_error(format!("Step '{}' has an argument without a name", step.id));
                    continue;
                }
                if binding.source_count() != 1 {
                    result.add_error(format!(
                        "Argument '{}' of step '{}' needs exactly one of param, files or like",
                        binding.name, step.id
                    ));
                }
                if let Some(reference) = binding.like_ref() {
                    let known = match reference.step {
                        None => own_args.contains(reference.arg),
                        Some(other) => seen
                            .get(other)
                            .is_some_and(|args| args.contains(reference.arg)),
                    };
                    if !known {
                        result.add_error(format!(
                            "Argument '{}' of step '{}' refers to unknown argument '{}'",
                            binding.name,
                            step.id,
                            binding.like.as_deref().unwrap_or_default()
                        ));
                    }
                }
                if !own_args.insert(binding.name.as_str()) {
                    result.add_error(format!(
                        "Duplicate argument '{}' in step '{}'",
                        binding.name, step.id
                    ));
                }
            }

            if let Some(cache) = &step.cache {
                for arg in [&cache.file_from, &cache.dataset_from] {
                    if !own_args.contains(arg.as_str()) {
                        result.add_error(format!(
                            "Cache directive of step '{}' refers to unknown argument '{}'",
                            step.id, arg
                        ));
                    }
                }
                if cache.tag.trim().is_empty() {
                    result.add_error(format!("Cache directive of step '{}' has no tag", step.id));
                }
            }

            if step.args.is_empty() {
                result.add_warning(format!("Step '{}' binds no files", step.id));
            }

            seen.insert(step.id.as_str(), own_args);
        }

        result
    }
}
