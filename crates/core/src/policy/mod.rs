//! Declarative field policy: read-only fields, closed enumerations,
//! descriptions and top-level grouping sections.
//!
//! Rules are loaded from a YAML source into an immutable [`RuleSet`]. The
//! process-wide active set lives in a [`PolicyStore`], which swaps whole
//! `Arc<RuleSet>` values on reload so concurrent readers see either the old
//! set or the new one, never a mixture.

pub mod overlay;

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::value::{Location, PathPattern, Scalar, Step, ValueNode};

pub use overlay::{apply, Overlay};

// ---------------------------------------------------------------------------
// Rule model
// ---------------------------------------------------------------------------

/// Grouping descriptor for top-level property keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Section {
    pub key: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// What a rule does to the nodes its pattern designates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "camelCase")]
pub enum Effect {
    ReadOnly,
    #[serde(rename = "enum")]
    EnumSource,
    Description { text: String },
    #[serde(rename = "section")]
    SectionAssignment { section: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyRule {
    #[serde(rename = "path")]
    pub pattern: PathPattern,
    #[serde(flatten)]
    pub effect: Effect,
}

impl PolicyRule {
    pub fn new(pattern: PathPattern, effect: Effect) -> Self {
        Self { pattern, effect }
    }
}

/// An immutable, fully validated set of rules in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleSet {
    sections: Vec<Section>,
    rules: Vec<PolicyRule>,
}

impl RuleSet {
    /// Build a rule set, checking that every section assignment names a
    /// declared section and that section keys are unique.
    pub fn new(sections: Vec<Section>, rules: Vec<PolicyRule>) -> Result<Self, ConfigError> {
        for (i, section) in sections.iter().enumerate() {
            if section.key.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("sections[{i}].key"),
                    detail: "section key must not be empty".into(),
                });
            }
            if sections[..i].iter().any(|s| s.key == section.key) {
                return Err(ConfigError::InvalidValue {
                    field: format!("sections[{i}].key"),
                    detail: format!("duplicate section key '{}'", section.key),
                });
            }
        }
        for (index, rule) in rules.iter().enumerate() {
            if let Effect::SectionAssignment { section } = &rule.effect {
                if !sections.iter().any(|s| &s.key == section) {
                    return Err(ConfigError::InvalidRule {
                        index,
                        path: rule.pattern.to_string(),
                        detail: format!("section '{section}' is not declared"),
                    });
                }
            }
        }
        Ok(Self { sections, rules })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `location` is designated by, or nested under, a read-only rule.
    pub fn is_read_only(&self, location: &Location) -> bool {
        self.rules
            .iter()
            .any(|r| r.effect == Effect::ReadOnly && r.pattern.covers(location))
    }

    /// Whether an enum rule designates `location` itself.
    pub fn is_enum_source(&self, location: &Location) -> bool {
        self.rules
            .iter()
            .any(|r| r.effect == Effect::EnumSource && r.pattern.designates(location))
    }

    /// Locations designated by an enum rule that are `location` or one of
    /// its ancestors, nearest first.
    pub fn enum_anchors(&self, location: &Location) -> Vec<Location> {
        let steps = location.steps();
        (0..steps.len())
            .rev()
            .filter(|&i| matches!(steps[i], Step::Key(_)))
            .map(|i| prefix(location, i + 1))
            .filter(|candidate| self.is_enum_source(candidate))
            .collect()
    }

    /// Parse a YAML rule source. `origin` names the source in errors.
    pub fn from_yaml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let source: RuleSource = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: origin.to_string(),
            detail: e.to_string(),
        })?;
        source.into_rule_set()
    }

    /// Load a rule set from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let set = Self::from_yaml_str(&content, &path.display().to_string())?;
        debug!(path = %path.display(), rules = set.len(), "policy rules parsed");
        Ok(set)
    }
}

fn prefix(location: &Location, len: usize) -> Location {
    location.steps()[..len]
        .iter()
        .cloned()
        .fold(Location::root(), |acc, step| acc.child(step))
}

/// The closed domain an enum rule derives from its node: the node's current
/// contents, provided it is a list of scalars.
pub fn enum_domain(node: &ValueNode) -> Option<Vec<Scalar>> {
    node.as_scalar_list()
        .map(|items| items.into_iter().cloned().collect())
}

// ---------------------------------------------------------------------------
// Source format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSource {
    #[serde(default)]
    sections: Vec<Section>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
    #[serde(default)]
    readonly_fields: Vec<String>,
    #[serde(default)]
    dropdown_fields: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RuleEntry {
    path: String,
    #[serde(default)]
    read_only: bool,
    #[serde(default, rename = "enum")]
    enum_source: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    section: Option<String>,
}

impl RuleSource {
    fn into_rule_set(self) -> Result<RuleSet, ConfigError> {
        let mut rules = Vec::new();
        let entries = self.rules.into_iter().chain(
            self.readonly_fields
                .into_iter()
                .map(|path| RuleEntry::flag(path, true, false)),
        );
        let entries = entries.chain(
            self.dropdown_fields
                .into_iter()
                .map(|path| RuleEntry::flag(path, false, true)),
        );

        for (index, entry) in entries.enumerate() {
            let pattern = PathPattern::parse(&entry.path).map_err(|e| ConfigError::InvalidRule {
                index,
                path: entry.path.clone(),
                detail: e.to_string(),
            })?;
            let before = rules.len();
            if entry.read_only {
                rules.push(PolicyRule::new(pattern.clone(), Effect::ReadOnly));
            }
            if entry.enum_source {
                rules.push(PolicyRule::new(pattern.clone(), Effect::EnumSource));
            }
            if let Some(text) = entry.description {
                rules.push(PolicyRule::new(pattern.clone(), Effect::Description { text }));
            }
            if let Some(section) = entry.section {
                rules.push(PolicyRule::new(pattern, Effect::SectionAssignment { section }));
            }
            if rules.len() == before {
                return Err(ConfigError::InvalidRule {
                    index,
                    path: entry.path,
                    detail: "rule has no effect (set readOnly, enum, description or section)".into(),
                });
            }
        }
        RuleSet::new(self.sections, rules)
    }
}

impl RuleEntry {
    fn flag(path: String, read_only: bool, enum_source: bool) -> Self {
        Self {
            path,
            read_only,
            enum_source,
            description: None,
            section: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Owner of the process-wide active rule set.
#[derive(Debug)]
pub struct PolicyStore {
    source: Option<PathBuf>,
    active: RwLock<Arc<RuleSet>>,
}

impl PolicyStore {
    /// Load the initial rule set from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let rules = RuleSet::load(path)?;
        info!(path = %path.display(), rules = rules.len(), "policy loaded");
        Ok(Self {
            source: Some(path.to_path_buf()),
            active: RwLock::new(Arc::new(rules)),
        })
    }

    /// An empty store that reads `path` on the next reload.
    pub fn empty_at<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            source: Some(path.into()),
            active: RwLock::new(Arc::new(RuleSet::default())),
        }
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Snapshot of the active rule set.
    pub fn current(&self) -> Arc<RuleSet> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the source and swap it in. On any error the previous set
    /// stays active.
    pub fn reload(&self) -> Result<Arc<RuleSet>, ConfigError> {
        let Some(path) = &self.source else {
            return Ok(self.current());
        };
        let fresh = match RuleSet::load(path) {
            Ok(set) => Arc::new(set),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "policy reload failed; keeping previous rules");
                return Err(e);
            }
        };
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        info!(path = %path.display(), rules = fresh.len(), "policy reloaded");
        Ok(fresh)
    }
}
