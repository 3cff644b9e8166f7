// Tool defaults descriptors
//
// Tools describe their parameters in a ParamXML `.ini` file produced by
// `<tool> -write_ini <path>`. Parameter keys are the NODE path below the
// tool's instance node joined with `:` ("algorithm:signal_to_noise").

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ParameterError;

/// One documented tool parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    /// Default value, typed from the descriptor
    pub value: Value,
    /// Declared type (`int`, `double`, `string`, `input-file`, ...)
    pub param_type: String,
    pub description: String,
    /// Allowed values, when restricted to a set
    pub valid_strings: Vec<String>,
    pub tags: Vec<String>,
}

impl ParamEntry {
    pub fn is_advanced(&self) -> bool {
        self.tags.iter().any(|tag| tag == "advanced")
    }

    pub fn is_file(&self) -> bool {
        self.param_type.ends_with("-file") || self.param_type.ends_with("-prefix")
    }
}

/// Parsed defaults of one tool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolDefaults {
    pub tool: String,
    pub entries: BTreeMap<String, ParamEntry>,
}

/// An ITEMLIST being collected
struct PendingList {
    key: String,
    entry: ParamEntry,
    items: Vec<String>,
}

impl ToolDefaults {
    /// Read and parse a descriptor file
    pub fn load(tool: &str, path: &Path) -> Result<Self, ParameterError> {
        let text = std::fs::read_to_string(path).map_err(|source| ParameterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(tool, &text).map_err(|reason| ParameterError::InvalidDescriptor {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse descriptor text
    pub fn parse(tool: &str, xml: &str) -> Result<Self, String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut defaults = ToolDefaults {
            tool: tool.to_string(),
            entries: BTreeMap::new(),
        };
        let mut nodes: Vec<String> = Vec::new();
        let mut pending: Option<PendingList> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| format!("at byte {}: {}", reader.buffer_position(), e))?;
            match event {
                Event::Start(e) => match e.name().as_ref() {
                    b"NODE" => nodes.push(attribute(&e, "name")?.unwrap_or_default()),
                    b"ITEM" => defaults.add_item(&nodes, &e)?,
                    b"ITEMLIST" => pending = defaults.start_list(&nodes, &e)?,
                    b"LISTITEM" => push_list_item(&mut pending, &e)?,
                    _ => {}
                },
                Event::Empty(e) => match e.name().as_ref() {
                    b"ITEM" => defaults.add_item(&nodes, &e)?,
                    b"ITEMLIST" => {
                        if let Some(list) = defaults.start_list(&nodes, &e)? {
                            defaults.finish_list(list);
                        }
                    }
                    b"LISTITEM" => push_list_item(&mut pending, &e)?,
                    _ => {}
                },
                Event::End(e) => match e.name().as_ref() {
                    b"NODE" => {
                        nodes.pop();
                    }
                    b"ITEMLIST" => {
                        if let Some(list) = pending.take() {
                            defaults.finish_list(list);
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(defaults)
    }

    /// Default of one parameter
    pub fn default_value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// All defaults as a key -> value map
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Key for an item below the tool's instance node, `None` for
    /// descriptor metadata outside it
    fn key_for(nodes: &[String], name: &str) -> Option<String> {
        if nodes.len() < 2 || nodes[1] != "1" {
            return None;
        }
        let mut parts: Vec<&str> = nodes[2..].iter().map(String::as_str).collect();
        parts.push(name);
        Some(parts.join(":"))
    }

    fn add_item(&mut self, nodes: &[String], e: &BytesStart<'_>) -> Result<(), String> {
        let name = attribute(e, "name")?.unwrap_or_default();
        let Some(key) = Self::key_for(nodes, &name) else {
            return Ok(());
        };
        let mut entry = entry_from(e)?;
        let raw = attribute(e, "value")?.unwrap_or_default();
        entry.value = typed_value(&entry, &raw);
        self.entries.insert(key, entry);
        Ok(())
    }

    fn start_list(
        &mut self,
        nodes: &[String],
        e: &BytesStart<'_>,
    ) -> Result<Option<PendingList>, String> {
        let name = attribute(e, "name")?.unwrap_or_default();
        let Some(key) = Self::key_for(nodes, &name) else {
            return Ok(None);
        };
        Ok(Some(PendingList {
            key,
            entry: entry_from(e)?,
            items: Vec::new(),
        }))
    }

    fn finish_list(&mut self, list: PendingList) {
        let PendingList {
            key,
            mut entry,
            items,
        } = list;
        entry.value = Value::Array(items.iter().map(|item| typed_value(&entry, item)).collect());
        self.entries.insert(key, entry);
    }
}

fn push_list_item(pending: &mut Option<PendingList>, e: &BytesStart<'_>) -> Result<(), String> {
    if let Some(list) = pending.as_mut() {
        list.items.push(attribute(e, "value")?.unwrap_or_default());
    }
    Ok(())
}

fn entry_from(e: &BytesStart<'_>) -> Result<ParamEntry, String> {
    let split = |value: Option<String>| -> Vec<String> {
        value
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    };
    Ok(ParamEntry {
        value: Value::Null,
        param_type: attribute(e, "type")?.unwrap_or_else(|| "string".to_string()),
        description: attribute(e, "description")?.unwrap_or_default(),
        valid_strings: split(attribute(e, "restrictions")?),
        tags: split(attribute(e, "tags")?),
    })
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, String> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Convert a raw descriptor string into the JSON type the tool declares.
/// Values that do not parse as declared stay strings.
fn typed_value(entry: &ParamEntry, raw: &str) -> Value {
    let is_flag = entry.param_type == "bool"
        || (entry.param_type == "string"
            && entry.valid_strings.len() == 2
            && entry.valid_strings.iter().all(|s| s == "true" || s == "false"));

    if is_flag {
        return Value::Bool(raw == "true");
    }

    match entry.param_type.as_str() {
        "int" => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        "double" | "float" => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        _ => Value::String(raw.to_string()),
    }
}

/// Equality used when deciding whether a value differs from its default.
/// Numbers compare by value so `5` and `5.0` are the same.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        _ => a == b,
    }
}
