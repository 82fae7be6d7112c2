//! Canonical in-memory form of a values document.
//!
//! A [`ValueNode`] is a strict tree of scalars, ordered lists and ordered
//! maps. Map entries keep their insertion order so that a document rendered
//! back to YAML or JSON comes out in the order it was read.

pub mod path;

use std::fmt;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

pub use path::{Location, PathPattern, PatternError, Step};

/// A leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl Scalar {
    /// Type name used in schemas and diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(n) if n.is_f64() => "number",
            Self::Number(_) => "integer",
            Self::String(_) => "string",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// One node of a values document.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueNode {
    Scalar(Scalar),
    List(Vec<ValueNode>),
    /// Ordered entries; keys are unique.
    Map(Vec<(String, ValueNode)>),
}

impl Default for ValueNode {
    fn default() -> Self {
        Self::Map(Vec::new())
    }
}

impl ValueNode {
    pub fn null() -> Self {
        Self::Scalar(Scalar::Null)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::Scalar(Scalar::String(s.into()))
    }

    /// Coarse kind: `map`, `list`, or the scalar's type name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Scalar(s) => s.kind_name(),
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Scalar::Null))
    }

    /// Look up a direct child of a map.
    pub fn get(&self, key: &str) -> Option<&ValueNode> {
        match self {
            Self::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Resolve a concrete location.
    pub fn at(&self, location: &Location) -> Option<&ValueNode> {
        let mut node = self;
        for step in location.steps() {
            node = match (step, node) {
                (Step::Key(k), Self::Map(_)) => node.get(k)?,
                (Step::Index(i), Self::List(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// The elements of this node if it is a list made only of scalars.
    pub fn as_scalar_list(&self) -> Option<Vec<&Scalar>> {
        match self {
            Self::List(items) => items
                .iter()
                .map(|item| match item {
                    Self::Scalar(s) => Some(s),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Scalar(s) => s.to_json(),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Self::Scalar(Scalar::Null) => serde_yaml::Value::Null,
            Self::Scalar(Scalar::Bool(b)) => serde_yaml::Value::Bool(*b),
            Self::Scalar(Scalar::Number(n)) => serde_yaml::Value::Number(json_number_to_yaml(n)),
            Self::Scalar(Scalar::String(s)) => serde_yaml::Value::String(s.clone()),
            Self::List(items) => serde_yaml::Value::Sequence(items.iter().map(Self::to_yaml).collect()),
            Self::Map(entries) => {
                let mut mapping = serde_yaml::Mapping::new();
                for (k, v) in entries {
                    mapping.insert(serde_yaml::Value::String(k.clone()), v.to_yaml());
                }
                serde_yaml::Value::Mapping(mapping)
            }
        }
    }
}

fn json_number_to_yaml(n: &serde_json::Number) -> serde_yaml::Number {
    if let Some(u) = n.as_u64() {
        u.into()
    } else if let Some(i) = n.as_i64() {
        i.into()
    } else {
        n.as_f64().unwrap_or_default().into()
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<serde_json::Value> for ValueNode {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::null(),
            serde_json::Value::Bool(b) => Self::Scalar(Scalar::Bool(b)),
            serde_json::Value::Number(n) => Self::Scalar(Scalar::Number(n)),
            serde_json::Value::String(s) => Self::string(s),
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<serde_yaml::Value> for ValueNode {
    fn from(value: serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => Self::null(),
            serde_yaml::Value::Bool(b) => Self::Scalar(Scalar::Bool(b)),
            serde_yaml::Value::Number(n) => {
                let number = if let Some(u) = n.as_u64() {
                    Some(serde_json::Number::from(u))
                } else if let Some(i) = n.as_i64() {
                    Some(serde_json::Number::from(i))
                } else {
                    n.as_f64().and_then(serde_json::Number::from_f64)
                };
                match number {
                    Some(num) => Self::Scalar(Scalar::Number(num)),
                    // .inf / .nan have no JSON form
                    None => Self::string(n.to_string()),
                }
            }
            serde_yaml::Value::String(s) => Self::string(s),
            serde_yaml::Value::Sequence(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_yaml::Value::Mapping(mapping) => {
                let mut entries: Vec<(String, ValueNode)> = Vec::with_capacity(mapping.len());
                for (k, v) in mapping {
                    let key = yaml_key_to_string(k);
                    let node = Self::from(v);
                    match entries.iter_mut().find(|(existing, _)| *existing == key) {
                        Some(slot) => slot.1 = node,
                        None => entries.push((key, node)),
                    }
                }
                Self::Map(entries)
            }
            serde_yaml::Value::Tagged(tagged) => Self::from(tagged.value),
        }
    }
}

fn yaml_key_to_string(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Null => "null".into(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

impl Serialize for ValueNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Scalar(Scalar::Null) => serializer.serialize_unit(),
            Self::Scalar(Scalar::Bool(b)) => serializer.serialize_bool(*b),
            Self::Scalar(Scalar::Number(n)) => n.serialize(serializer),
            Self::Scalar(Scalar::String(s)) => serializer.serialize_str(s),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ValueNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // serde_json is built with preserve_order, so key order survives.
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}
