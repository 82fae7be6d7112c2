//! Applying a [`RuleSet`] onto a synthesized schema.
//!
//! Patterns are resolved against the value tree, never the schema, and the
//! corresponding schema nodes are annotated on a fresh copy. Nothing is
//! cached between calls: every overlay is computed from the rule set and
//! tree it is given.

use std::collections::HashSet;

use tracing::warn;

use super::{enum_domain, Effect, RuleSet, Section};
use crate::errors::PolicyError;
use crate::schema::SchemaNode;
use crate::value::{Location, Scalar, Step, ValueNode};

const DIVERGENT_DOMAINS: &str = "enum domain differs between list elements";

/// Result of an overlay: the annotated schema plus everything that could
/// not be applied.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub schema: SchemaNode,
    pub sections: Vec<Section>,
    pub issues: Vec<PolicyError>,
}

impl Overlay {
    /// Schema JSON including `sections` and any `x-policy-issues`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = self.schema.to_json();
        if let serde_json::Value::Object(map) = &mut out {
            map.insert("required".into(), serde_json::Value::Array(Vec::new()));
            map.insert(
                "sections".into(),
                serde_json::to_value(&self.sections).unwrap_or_default(),
            );
            if !self.issues.is_empty() {
                map.insert(
                    "x-policy-issues".into(),
                    self.issues.iter().map(ToString::to_string).collect(),
                );
            }
        }
        out
    }
}

/// Annotate a copy of `schema` according to `rules`, resolving every rule
/// pattern against `tree`.
pub fn apply(schema: &SchemaNode, tree: &ValueNode, rules: &RuleSet) -> Overlay {
    let mut out = schema.clone();
    let mut issues = Vec::new();

    for rule in rules.rules() {
        if let Effect::SectionAssignment { section } = &rule.effect {
            assign_section(&mut out, &rule.pattern.to_string(), rule.pattern.segments(), section, &mut issues);
            continue;
        }

        let mut annotated: HashSet<String> = HashSet::new();
        for location in rule.pattern.resolve(tree) {
            let first_visit = annotated.insert(schema_address(&location));
            if !first_visit && rule.effect != Effect::EnumSource {
                continue;
            }
            let Some(node) = out.node_at_mut(&location) else {
                // Element's shape differs from the first list element.
                continue;
            };
            match &rule.effect {
                Effect::ReadOnly => mark_read_only(node),
                Effect::Description { text } => node.description = Some(text.clone()),
                Effect::EnumSource => {
                    let value = tree.at(&location);
                    match value.and_then(enum_domain) {
                        Some(domain) if first_visit => node.enum_values = Some(domain),
                        Some(domain) => narrow_domain(node, &domain, &location),
                        None => {
                            let issue = PolicyError::PolicyConflict {
                                pattern: rule.pattern.to_string(),
                                location: location.to_string(),
                                found: value.map_or("absent", ValueNode::kind_name).to_string(),
                            };
                            warn!(%issue, "enum rule not applied");
                            issues.push(issue);
                        }
                    }
                }
                Effect::SectionAssignment { .. } => {}
            }
        }
    }

    Overlay {
        schema: out,
        sections: rules.sections().to_vec(),
        issues,
    }
}

/// Several list elements share one item schema. Offer only the choices
/// every element's own domain accepts.
fn narrow_domain(node: &mut SchemaNode, domain: &[Scalar], location: &Location) {
    let Some(shown) = node.enum_values.as_mut() else {
        node.enum_values = Some(domain.to_vec());
        return;
    };
    if shown.len() == domain.len() && shown.iter().all(|s| domain.contains(s)) {
        return;
    }
    shown.retain(|s| domain.contains(s));
    node.unsupported = Some(DIVERGENT_DOMAINS.into());
    warn!(location = %location, "enum domain differs between list elements; offering the common choices");
}

fn assign_section(
    schema: &mut SchemaNode,
    pattern: &str,
    segments: &[String],
    section: &str,
    issues: &mut Vec<PolicyError>,
) {
    let detail = match segments {
        [key] => match schema.property_mut(key) {
            Some(node) => {
                node.section = Some(section.to_string());
                return;
            }
            None => "no such top-level key".to_string(),
        },
        _ => "sections apply to top-level keys only".to_string(),
    };
    let issue = PolicyError::SectionDropped {
        pattern: pattern.to_string(),
        section: section.to_string(),
        detail,
    };
    warn!(%issue, "section assignment dropped");
    issues.push(issue);
}

fn mark_read_only(node: &mut SchemaNode) {
    node.read_only = true;
    for (_, child) in node.properties.iter_mut() {
        mark_read_only(child);
    }
    if let Some(items) = node.items.as_deref_mut() {
        mark_read_only(items);
    }
}

/// Locations that land on the same schema node share an address: list
/// indices all map to the item schema.
fn schema_address(location: &Location) -> String {
    location
        .steps()
        .iter()
        .map(|step| match step {
            Step::Key(k) => k.as_str(),
            Step::Index(_) => "[]",
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::synthesize;
    use serde_json::json;

    fn tree() -> ValueNode {
        ValueNode::from(json!({
            "image": {"repository": "nginx", "tag": "1.0"},
            "environments": ["dev", "staging", "prod"],
            "ingress": {"hosts": [
                {"host": "a", "tls": {"secretName": "s1"}},
                {"host": "b", "tls": {"secretName": "s2"}}
            ]},
            "replicas": 2
        }))
    }

    fn rules(src: &str) -> RuleSet {
        RuleSet::from_yaml_str(src, "inline").unwrap()
    }

    #[test]
    fn test_read_only_and_description() {
        let t = tree();
        let set = rules(
            "rules:\n  - {path: image.repository, readOnly: true, description: first}\n  - {path: image.repository, description: second}\n",
        );
        let overlay = apply(&synthesize(&t), &t, &set);
        let repo = overlay.schema.property("image").unwrap().property("repository").unwrap();
        assert!(repo.read_only);
        assert_eq!(repo.description.as_deref(), Some("second"));
        assert!(!overlay.schema.property("image").unwrap().property("tag").unwrap().read_only);
        assert!(overlay.issues.is_empty());
    }

    #[test]
    fn test_read_only_through_list_items() {
        let t = tree();
        let overlay = apply(&synthesize(&t), &t, &rules("readonly_fields: [ingress.hosts.tls.secretName]\n"));
        let json = overlay.to_json();
        let item = &json["properties"]["ingress"]["properties"]["hosts"]["items"];
        assert_eq!(item["properties"]["tls"]["properties"]["secretName"]["readOnly"], true);
        assert!(item["properties"]["host"].get("readOnly").is_none());
    }

    #[test]
    fn test_read_only_object_marks_descendants() {
        let t = tree();
        let overlay = apply(&synthesize(&t), &t, &rules("readonly_fields: [image]\n"));
        let image = overlay.schema.property("image").unwrap();
        assert!(image.read_only);
        assert!(image.property("tag").unwrap().read_only);
    }

    #[test]
    fn test_enum_domain_is_current_list() {
        let mut t = tree();
        let set = rules("dropdown_fields: [environments]\n");
        let overlay = apply(&synthesize(&t), &t, &set);
        assert_eq!(
            overlay.to_json()["properties"]["environments"]["enum"],
            json!(["dev", "staging", "prod"])
        );

        if let ValueNode::Map(entries) = &mut t {
            entries[1].1 = ValueNode::from(json!(["dev", "prod"]));
        }
        let overlay = apply(&synthesize(&t), &t, &set);
        assert_eq!(
            overlay.to_json()["properties"]["environments"]["enum"],
            json!(["dev", "prod"])
        );
    }

    #[test]
    fn test_enum_on_non_list_is_reported() {
        let t = tree();
        let overlay = apply(&synthesize(&t), &t, &rules("dropdown_fields: [replicas, image]\n"));
        assert_eq!(overlay.issues.len(), 2);
        assert!(matches!(&overlay.issues[0], PolicyError::PolicyConflict { location, .. } if location == "replicas"));
        assert!(overlay.schema.property("replicas").unwrap().enum_values.is_none());
        assert!(overlay.to_json()["x-policy-issues"].is_array());
    }

    #[test]
    fn test_enum_on_ancestor_reported_nested_enum_kept() {
        let t = ValueNode::from(json!({"hosts": [{"envs": ["dev", "prod"]}]}));
        let overlay = apply(&synthesize(&t), &t, &rules("dropdown_fields: [hosts, hosts.envs]\n"));
        assert_eq!(overlay.issues.len(), 1);
        assert!(matches!(&overlay.issues[0], PolicyError::PolicyConflict { location, .. } if location == "hosts"));
        let json = overlay.to_json();
        assert!(json["properties"]["hosts"].get("enum").is_none());
        assert_eq!(
            json["properties"]["hosts"]["items"]["properties"]["envs"]["enum"],
            json!(["dev", "prod"])
        );
    }

    #[test]
    fn test_per_element_domains_show_common_choices() {
        let t = ValueNode::from(json!({"hosts": [
            {"envs": ["dev", "prod"]},
            {"envs": ["prod", "qa"]}
        ]}));
        let overlay = apply(&synthesize(&t), &t, &rules("dropdown_fields: [hosts.envs]\n"));
        let json = overlay.to_json();
        let envs = &json["properties"]["hosts"]["items"]["properties"]["envs"];
        assert_eq!(envs["enum"], json!(["prod"]));
        assert_eq!(envs["x-unsupported"], DIVERGENT_DOMAINS);
        assert!(overlay.issues.is_empty());

        let same = ValueNode::from(json!({"hosts": [{"envs": ["dev", "prod"]}, {"envs": ["prod", "dev"]}]}));
        let overlay = apply(&synthesize(&same), &same, &rules("dropdown_fields: [hosts.envs]\n"));
        let envs = &overlay.to_json()["properties"]["hosts"]["items"]["properties"]["envs"];
        assert_eq!(envs["enum"], json!(["dev", "prod"]));
        assert!(envs.get("x-unsupported").is_none());
    }

    #[test]
    fn test_sections_top_level_only() {
        let t = tree();
        let src = r#"
sections:
  - {key: main, title: Main, icon: star}
rules:
  - {path: image, section: main}
  - {path: image.tag, section: main}
  - {path: missing, section: main}
"#;
        let overlay = apply(&synthesize(&t), &t, &rules(src));
        assert_eq!(overlay.schema.property("image").unwrap().section.as_deref(), Some("main"));
        assert_eq!(overlay.issues.len(), 2);
        assert!(overlay
            .issues
            .iter()
            .all(|i| matches!(i, PolicyError::SectionDropped { .. })));
        let json = overlay.to_json();
        assert_eq!(json["sections"][0]["icon"], "star");
        assert_eq!(json["properties"]["image"]["x-section"], "main");
    }

    #[test]
    fn test_overlay_leaves_inputs_untouched() {
        let t = tree();
        let schema = synthesize(&t);
        let snapshot_tree = t.clone();
        let snapshot_schema = schema.clone();
        let _ = apply(&schema, &t, &rules("readonly_fields: [image]\ndropdown_fields: [environments]\n"));
        assert_eq!(t, snapshot_tree);
        assert_eq!(schema, snapshot_schema);
    }
}
