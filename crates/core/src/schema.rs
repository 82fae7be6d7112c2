//! Schema synthesis from a value tree.
//!
//! [`synthesize`] derives a typed, ordered schema from whatever document it
//! is handed. It is pure and total: every tree yields a schema. List item
//! schemas are inferred from the first element only; lists whose elements
//! disagree in shape are flagged as unsupported rather than reconciled.

use tracing::warn;

use crate::errors::SchemaError;
use crate::value::{Location, Scalar, Step, ValueNode};

/// Marker attached to arrays whose elements do not share one shape.
pub const HETEROGENEOUS_LIST: &str = "heterogeneous list items";

/// Inferred JSON type of a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    String,
    Integer,
    Number,
    Boolean,
    /// Untyped placeholder for `null` values; rendered as a nullable string.
    Null,
    Object,
    Array,
}

impl SchemaType {
    fn of_scalar(scalar: &Scalar) -> Self {
        match scalar {
            Scalar::Null => Self::Null,
            Scalar::Bool(_) => Self::Boolean,
            Scalar::Number(n) if n.is_f64() => Self::Number,
            Scalar::Number(_) => Self::Integer,
            Scalar::String(_) => Self::String,
        }
    }

    fn to_json(self) -> serde_json::Value {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Null => return serde_json::json!(["string", "null"]),
            Self::Object => "object",
            Self::Array => "array",
        };
        serde_json::Value::String(name.into())
    }
}

/// Schema description of one value node plus its policy metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    pub kind: SchemaType,
    /// Object properties, in the document's key order.
    pub properties: Vec<(String, SchemaNode)>,
    /// Array item schema (from the first element).
    pub items: Option<Box<SchemaNode>>,
    /// Current value, carried by leaves and arrays.
    pub default: Option<ValueNode>,
    pub read_only: bool,
    pub description: Option<String>,
    /// Closed domain when an enum rule applies.
    pub enum_values: Option<Vec<Scalar>>,
    /// Section id; only set on top-level properties.
    pub section: Option<String>,
    pub unsupported: Option<String>,
}

impl SchemaNode {
    fn new(kind: SchemaType) -> Self {
        Self {
            kind,
            properties: Vec::new(),
            items: None,
            default: None,
            read_only: false,
            description: None,
            enum_values: None,
            section: None,
            unsupported: None,
        }
    }

    pub fn property(&self, key: &str) -> Option<&SchemaNode> {
        self.properties.iter().find(|(k, _)| k == key).map(|(_, s)| s)
    }

    pub fn property_mut(&mut self, key: &str) -> Option<&mut SchemaNode> {
        self.properties
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, s)| s)
    }

    /// The schema node describing the value at `location`. List indices map
    /// onto the shared item schema.
    pub fn node_at_mut(&mut self, location: &Location) -> Option<&mut SchemaNode> {
        let mut node = self;
        for step in location.steps() {
            node = match step {
                Step::Key(k) => node.property_mut(k)?,
                Step::Index(_) => node.items.as_deref_mut()?,
            };
        }
        Some(node)
    }

    /// Render as a JSON-Schema-style object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        match &self.enum_values {
            Some(domain) => {
                let item_kind = domain
                    .first()
                    .map(SchemaType::of_scalar)
                    .unwrap_or(SchemaType::String);
                out.insert("type".into(), item_kind.to_json());
                out.insert(
                    "enum".into(),
                    serde_json::Value::Array(domain.iter().map(Scalar::to_json).collect()),
                );
            }
            None => {
                out.insert("type".into(), self.kind.to_json());
                if self.kind == SchemaType::Object {
                    let props: serde_json::Map<String, serde_json::Value> = self
                        .properties
                        .iter()
                        .map(|(k, s)| (k.clone(), s.to_json()))
                        .collect();
                    out.insert("properties".into(), serde_json::Value::Object(props));
                }
                if let Some(items) = &self.items {
                    out.insert("items".into(), items.to_json());
                }
                if let Some(default) = &self.default {
                    out.insert("default".into(), default.to_json());
                }
            }
        }
        if self.read_only {
            out.insert("readOnly".into(), serde_json::Value::Bool(true));
        }
        if let Some(description) = &self.description {
            out.insert("description".into(), description.clone().into());
        }
        if let Some(section) = &self.section {
            out.insert("x-section".into(), section.clone().into());
        }
        if let Some(reason) = &self.unsupported {
            out.insert("x-unsupported".into(), reason.clone().into());
        }
        serde_json::Value::Object(out)
    }
}

/// Derive a schema from `tree`. Never fails.
pub fn synthesize(tree: &ValueNode) -> SchemaNode {
    synthesize_node(tree, true)
}

/// Like [`synthesize`], but insists on a mapping at the root, which is what
/// a values document must be.
pub fn synthesize_document(tree: &ValueNode) -> Result<SchemaNode, SchemaError> {
    match tree {
        ValueNode::Map(_) => Ok(synthesize(tree)),
        other => Err(SchemaError::RootNotMap(other.kind_name().to_string())),
    }
}

fn synthesize_node(node: &ValueNode, with_defaults: bool) -> SchemaNode {
    match node {
        ValueNode::Scalar(scalar) => {
            let mut schema = SchemaNode::new(SchemaType::of_scalar(scalar));
            if with_defaults {
                schema.default = Some(node.clone());
            }
            schema
        }
        ValueNode::Map(entries) => {
            let mut schema = SchemaNode::new(SchemaType::Object);
            schema.properties = entries
                .iter()
                .map(|(k, v)| (k.clone(), synthesize_node(v, with_defaults)))
                .collect();
            schema
        }
        ValueNode::List(items) => {
            let mut schema = SchemaNode::new(SchemaType::Array);
            schema.items = Some(Box::new(match items.first() {
                Some(first) => synthesize_node(first, false),
                None => SchemaNode::new(SchemaType::String),
            }));
            if let Some(first) = items.first() {
                if items.iter().skip(1).any(|item| !same_shape(first, item)) {
                    warn!(
                        first = first.kind_name(),
                        len = items.len(),
                        "list elements differ in shape; item schema follows the first element"
                    );
                    schema.unsupported = Some(HETEROGENEOUS_LIST.into());
                }
            }
            if with_defaults {
                schema.default = Some(node.clone());
            }
            schema
        }
    }
}

/// Structural compatibility used for the first-element item inference.
/// Nulls are compatible with anything and integers with floats.
fn same_shape(a: &ValueNode, b: &ValueNode) -> bool {
    match (a, b) {
        (ValueNode::Scalar(Scalar::Null), _) | (_, ValueNode::Scalar(Scalar::Null)) => true,
        (ValueNode::Scalar(x), ValueNode::Scalar(y)) => {
            let numeric = |s: &Scalar| matches!(s, Scalar::Number(_));
            x.kind_name() == y.kind_name() || (numeric(x) && numeric(y))
        }
        (ValueNode::Map(xs), ValueNode::Map(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, xv)| b.get(k).is_some_and(|yv| same_shape(xv, yv)))
        }
        (ValueNode::List(xs), ValueNode::List(ys)) => match (xs.first(), ys.first()) {
            (Some(x), Some(y)) => same_shape(x, y),
            _ => true,
        },
        _ => false,
    }
}

/// Rebuild the value tree a form would submit if nothing were edited.
pub fn render_defaults(schema: &SchemaNode) -> ValueNode {
    match schema.kind {
        SchemaType::Object => ValueNode::Map(
            schema
                .properties
                .iter()
                .map(|(k, s)| (k.clone(), render_defaults(s)))
                .collect(),
        ),
        _ => schema.default.clone().unwrap_or_else(ValueNode::null),
    }
}
