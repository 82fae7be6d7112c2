//! Dotted path patterns and their resolution against a value tree.
//!
//! A pattern such as `ingress.hosts.tls.secretName` never contains list
//! indices. When resolution reaches a list while segments remain, the
//! remaining suffix is applied to every element independently, so one
//! pattern may designate many nodes. A pattern that ends exactly on a list
//! designates the list itself, not its elements.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ValueNode;

/// Why a dotted path string could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("path is empty")]
    Empty,
    #[error("path '{0}' contains an empty segment")]
    EmptySegment(String),
}

/// A dot-separated sequence of map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathPattern {
    segments: Vec<String>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PatternError::EmptySegment(raw.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Resolve this pattern against `tree`, returning every designated node
    /// location in document order. Absent keys simply contribute nothing.
    pub fn resolve(&self, tree: &ValueNode) -> Vec<Location> {
        let mut out = Vec::new();
        let mut trail = Vec::new();
        resolve_into(tree, &self.segments, &mut trail, &mut out);
        out
    }

    /// Whether `location` is one of the nodes this pattern designates in any
    /// tree that contains it. Agrees with [`resolve`](Self::resolve): the
    /// location must end on a key and its keys, indices removed, must equal
    /// the pattern's segments.
    pub fn designates(&self, location: &Location) -> bool {
        matches!(location.steps().last(), Some(Step::Key(_)))
            && location.keys().eq(self.segments.iter().map(String::as_str))
    }

    /// Whether `location` is a designated node or lies underneath one.
    pub fn covers(&self, location: &Location) -> bool {
        let mut matched = 0;
        for step in location.steps() {
            if let Step::Key(key) = step {
                if matched == self.segments.len() || self.segments[matched] != *key {
                    return false;
                }
                matched += 1;
                if matched == self.segments.len() {
                    return true;
                }
            }
        }
        false
    }
}

fn resolve_into(node: &ValueNode, rest: &[String], trail: &mut Vec<Step>, out: &mut Vec<Location>) {
    let Some((head, tail)) = rest.split_first() else {
        out.push(Location(trail.clone()));
        return;
    };
    match node {
        ValueNode::Map(_) => {
            if let Some(child) = node.get(head) {
                trail.push(Step::Key(head.clone()));
                resolve_into(child, tail, trail, out);
                trail.pop();
            }
        }
        ValueNode::List(items) => {
            for (i, item) in items.iter().enumerate() {
                trail.push(Step::Index(i));
                resolve_into(item, rest, trail, out);
                trail.pop();
            }
        }
        ValueNode::Scalar(_) => {}
    }
}

impl FromStr for PathPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl Serialize for PathPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PathPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Concrete locations
// ---------------------------------------------------------------------------

/// One step from a node to a child.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    Key(String),
    Index(usize),
}

/// A concrete node address, e.g. `ingress.hosts[1].tls.secretName`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Location(Vec<Step>);

impl Location {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Extend by one step, returning the new location.
    pub fn child(&self, step: Step) -> Self {
        let mut steps = self.0.clone();
        steps.push(step);
        Self(steps)
    }

    /// The map keys along this location, list indices skipped.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(|step| match step {
            Step::Key(k) => Some(k.as_str()),
            Step::Index(_) => None,
        })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for step in &self.0 {
            match step {
                Step::Key(k) if first => write!(f, "{k}")?,
                Step::Key(k) => write!(f, ".{k}")?,
                Step::Index(i) => write!(f, "[{i}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

impl Serialize for Location {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
