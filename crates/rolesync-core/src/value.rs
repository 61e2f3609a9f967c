//! Dynamic configuration tree
//!
//! The parsed YAML document is converted into [`Value`] at the boundary and
//! only the normalizer ever looks at it.

use std::collections::BTreeMap;

use crate::error::{SyncError, SyncResult};

/// A loosely typed node of the configuration document.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Human name of the node type, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Build a map node from key/value pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a list of string nodes.
    pub fn strings<S, I>(items: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        Value::List(items.into_iter().map(|s| Value::String(s.into())).collect())
    }

    /// Parse a YAML document into a value tree.
    pub fn from_yaml_str(text: &str) -> SyncResult<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| SyncError::config("<document>", format!("invalid YAML: {e}")))?;
        from_yaml(raw, "")
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl TryFrom<serde_yaml::Value> for Value {
    type Error = SyncError;

    fn try_from(raw: serde_yaml::Value) -> Result<Self, Self::Error> {
        from_yaml(raw, "")
    }
}

fn from_yaml(raw: serde_yaml::Value, path: &str) -> SyncResult<Value> {
    Ok(match raw {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => Value::List(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| from_yaml(item, &format!("{path}[{i}]")))
                .collect::<SyncResult<_>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = BTreeMap::new();
            for (key, value) in mapping {
                let serde_yaml::Value::String(key) = key else {
                    return Err(SyncError::config(
                        display_path(path),
                        "map keys must be strings",
                    ));
                };
                let child = join_key(path, &key);
                map.insert(key, from_yaml(value, &child)?);
            }
            Value::Map(map)
        }
        serde_yaml::Value::Tagged(tagged) => from_yaml(tagged.value, path)?,
    })
}

pub(crate) fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

pub(crate) fn display_path(path: &str) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.to_string()
    }
}
