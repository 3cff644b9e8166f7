// Tool invocation planning
//
// Turns one logical tool step (input/output bindings plus parameter
// overrides) into the concrete argument vectors to execute. Nothing here
// touches a process.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::InvocationError;

/// One value bound to an argument: a single path, or a group of paths
/// passed together to one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgItem {
    Single(String),
    Group(Vec<String>),
}

impl ArgItem {
    /// All paths of this item
    pub fn paths(&self) -> Vec<&str> {
        match self {
            ArgItem::Single(path) => vec![path.as_str()],
            ArgItem::Group(paths) => paths.iter().map(String::as_str).collect(),
        }
    }

    /// First path, used to name datasets after their input
    pub fn first(&self) -> Option<&str> {
        match self {
            ArgItem::Single(path) => Some(path),
            ArgItem::Group(paths) => paths.first().map(String::as_str),
        }
    }
}

impl From<&str> for ArgItem {
    fn from(path: &str) -> Self {
        ArgItem::Single(path.to_string())
    }
}

impl From<String> for ArgItem {
    fn from(path: String) -> Self {
        ArgItem::Single(path)
    }
}

impl From<&Path> for ArgItem {
    fn from(path: &Path) -> Self {
        ArgItem::Single(path.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for ArgItem {
    fn from(path: PathBuf) -> Self {
        ArgItem::from(path.as_path())
    }
}

/// A logical tool step ready to be expanded into commands
#[derive(Debug, Clone, Default)]
pub struct ToolInvocation {
    /// Executable name
    pub tool: String,
    /// Instance whose overrides apply, the tool itself when `None`
    pub instance: Option<String>,
    /// Argument name -> bound values, in command-line order
    pub io: Vec<(String, Vec<ArgItem>)>,
    /// Extra flags appended after the stored overrides
    pub custom: Vec<(String, Value)>,
}

impl ToolInvocation {
    pub fn new(tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
            ..Self::default()
        }
    }

    pub fn instance(mut self, instance: &str) -> Self {
        self.instance = Some(instance.to_string());
        self
    }

    pub fn arg<I, T>(mut self, name: &str, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ArgItem>,
    {
        self.io
            .push((name.to_string(), items.into_iter().map(Into::into).collect()));
        self
    }

    pub fn custom(mut self, name: &str, value: Value) -> Self {
        self.custom.push((name.to_string(), value));
        self
    }

    /// Key under which overrides are stored
    pub fn parameter_key(&self) -> &str {
        self.instance.as_deref().unwrap_or(&self.tool)
    }

    /// Number of commands this invocation expands to.
    ///
    /// Every multi-valued argument must share one length; length-1
    /// arguments are broadcast to every command.
    pub fn command_count(&self) -> Result<usize, InvocationError> {
        let lengths: Vec<usize> = self.io.iter().map(|(_, items)| items.len()).collect();
        if lengths.iter().any(|len| *len == 0) {
            return Err(InvocationError::MismatchedLengths {
                tool: self.tool.clone(),
                lengths,
            });
        }

        let mut multi = lengths.iter().copied().filter(|len| *len > 1);
        match multi.next() {
            None => Ok(1),
            Some(n) if multi.all(|len| len == n) => Ok(n),
            Some(_) => Err(InvocationError::MismatchedLengths {
                tool: self.tool.clone(),
                lengths,
            }),
        }
    }

    /// Build every argument vector.
    ///
    /// `overrides` are the stored non-default parameters of the tool or
    /// instance; `descriptor` is passed as `-ini` when given so the tool
    /// starts from the same defaults the configuration was made against.
    pub fn commands(
        &self,
        overrides: &BTreeMap<String, Value>,
        descriptor: Option<&Path>,
    ) -> Result<Vec<Vec<String>>, InvocationError> {
        let count = self.command_count()?;

        let mut commands = Vec::with_capacity(count);
        for i in 0..count {
            let mut argv = vec![self.tool.clone()];

            for (name, items) in &self.io {
                argv.push(format!("-{}", name));
                let item = if items.len() == 1 { &items[0] } else { &items[i] };
                argv.extend(item.paths().into_iter().map(String::from));
            }

            for (name, value) in overrides {
                render_override(&mut argv, name, value);
            }

            for (name, value) in &self.custom {
                render_custom(&mut argv, name, value);
            }

            if let Some(ini) = descriptor {
                argv.push("-ini".to_string());
                argv.push(ini.to_string_lossy().into_owned());
            }

            commands.push(argv);
        }

        Ok(commands)
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Stored override -> flag/value pairs.
///
/// `false` omits the flag, `true` leaves it bare, multi-line strings give
/// one value per line and lists give one value per element.
fn render_override(argv: &mut Vec<String>, name: &str, value: &Value) {
    match value {
        Value::Bool(false) | Value::Null => {}
        Value::Bool(true) => argv.push(format!("-{}", name)),
        Value::String(s) if s.contains('\n') => {
            argv.push(format!("-{}", name));
            argv.extend(s.split('\n').map(String::from));
        }
        Value::Array(items) => {
            argv.push(format!("-{}", name));
            argv.extend(items.iter().map(scalar));
        }
        other => {
            argv.push(format!("-{}", name));
            argv.push(scalar(other));
        }
    }
}

/// Custom flags always appear; empty values leave them bare.
fn render_custom(argv: &mut Vec<String>, name: &str, value: &Value) {
    argv.push(format!("-{}", name));
    match value {
        Value::Null | Value::Bool(false) => {}
        Value::String(s) if s.is_empty() => {}
        Value::Array(items) => argv.extend(items.iter().map(scalar)),
        other => argv.push(scalar(other)),
    }
}
