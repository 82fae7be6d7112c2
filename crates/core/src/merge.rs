//! Policy-constrained merge of a client-submitted tree into the
//! authoritative one.
//!
//! The walk pairs `current` and `submitted` by map key and list position.
//! Differences under a read-only rule, out-of-domain enum choices and
//! structural type changes are rejected per location; everything else the
//! client changed is taken. Nothing present in `current` is ever removed.
//!
//! Precedence when both apply to one node: read-only wins over enum.

use serde::Serialize;
use tracing::debug;

use crate::policy::{enum_domain, RuleSet};
use crate::value::{Location, Scalar, Step, ValueNode};

/// Why one submitted change was not applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The location is covered by a read-only rule.
    ReadOnly,
    /// The submitted choice is not in the enum's current domain.
    NotInDomain {
        value: ValueNode,
        allowed: Vec<ValueNode>,
    },
    /// The enum's domain list itself cannot be edited through a submission.
    EnumDomainImmutable,
    /// The submitted node has a different structure than the stored one.
    TypeMismatch { expected: String, found: String },
}

/// One rejected change, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub path: Location,
    #[serde(flatten)]
    pub reason: RejectionReason,
}

/// What a merge produced: the tree to persist plus rejected changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub applied: ValueNode,
    pub rejections: Vec<Rejection>,
}

/// Merge `submitted` into `current` under `rules`.
pub fn merge(current: &ValueNode, submitted: &ValueNode, rules: &RuleSet) -> MergeOutcome {
    let mut merger = Merger {
        rules,
        current_root: current,
        rejections: Vec::new(),
    };
    let applied = merger.merge_node(current, submitted, &Location::root());
    MergeOutcome {
        applied,
        rejections: merger.rejections,
    }
}

struct Merger<'a> {
    rules: &'a RuleSet,
    current_root: &'a ValueNode,
    rejections: Vec<Rejection>,
}

impl Merger<'_> {
    fn reject(&mut self, path: &Location, reason: RejectionReason) {
        debug!(path = %path, ?reason, "submitted change rejected");
        self.rejections.push(Rejection {
            path: path.clone(),
            reason,
        });
    }

    fn merge_node(&mut self, cur: &ValueNode, sub: &ValueNode, loc: &Location) -> ValueNode {
        if cur == sub {
            return cur.clone();
        }
        if self.rules.is_read_only(loc) {
            self.reject(loc, RejectionReason::ReadOnly);
            return cur.clone();
        }
        if self.rules.is_enum_source(loc) {
            // Enum rules on anything but a scalar list are not enforced;
            // the overlay reports them as policy conflicts instead.
            if let Some(domain) = enum_domain(cur) {
                return self.merge_enum(cur, sub, loc, &domain);
            }
        }

        match (cur, sub) {
            (ValueNode::Map(cur_entries), ValueNode::Map(sub_entries)) => {
                let mut out = Vec::with_capacity(cur_entries.len());
                for (key, cur_child) in cur_entries {
                    let child_loc = loc.child(Step::Key(key.clone()));
                    let merged = match sub.get(key) {
                        Some(sub_child) => self.merge_node(cur_child, sub_child, &child_loc),
                        None => cur_child.clone(),
                    };
                    out.push((key.clone(), merged));
                }
                for (key, sub_child) in sub_entries {
                    if cur.get(key).is_some() {
                        continue;
                    }
                    let child_loc = loc.child(Step::Key(key.clone()));
                    if let Some(admitted) = self.admit_new(sub_child, &child_loc) {
                        out.push((key.clone(), admitted));
                    }
                }
                ValueNode::Map(out)
            }
            (ValueNode::List(cur_items), ValueNode::List(sub_items)) => {
                let mut out = Vec::with_capacity(cur_items.len().max(sub_items.len()));
                for (i, cur_item) in cur_items.iter().enumerate() {
                    let merged = match sub_items.get(i) {
                        Some(sub_item) => self.merge_node(cur_item, sub_item, &loc.child(Step::Index(i))),
                        None => cur_item.clone(),
                    };
                    out.push(merged);
                }
                for (i, sub_item) in sub_items.iter().enumerate().skip(cur_items.len()) {
                    if let Some(admitted) = self.admit_new(sub_item, &loc.child(Step::Index(i))) {
                        out.push(admitted);
                    }
                }
                ValueNode::List(out)
            }
            // null is an untyped placeholder: anything may replace it
            (ValueNode::Scalar(Scalar::Null), _) => self.admit_new(sub, loc).unwrap_or_else(|| cur.clone()),
            (ValueNode::Scalar(_), ValueNode::Scalar(_)) => sub.clone(),
            _ => {
                self.reject(
                    loc,
                    RejectionReason::TypeMismatch {
                        expected: cur.kind_name().to_string(),
                        found: sub.kind_name().to_string(),
                    },
                );
                cur.clone()
            }
        }
    }

    /// `cur` is the enum's domain list and differs from `sub`.
    fn merge_enum(&mut self, cur: &ValueNode, sub: &ValueNode, loc: &Location, domain: &[Scalar]) -> ValueNode {
        match sub {
            ValueNode::Scalar(choice) if domain.contains(choice) => {
                debug!(path = %loc, value = %choice, "enum selection accepted");
            }
            ValueNode::Scalar(choice) => self.reject(
                loc,
                RejectionReason::NotInDomain {
                    value: ValueNode::Scalar(choice.clone()),
                    allowed: domain.iter().cloned().map(ValueNode::Scalar).collect(),
                },
            ),
            ValueNode::List(_) => self.reject(loc, RejectionReason::EnumDomainImmutable),
            ValueNode::Map(_) => self.reject(
                loc,
                RejectionReason::TypeMismatch {
                    expected: cur.kind_name().to_string(),
                    found: sub.kind_name().to_string(),
                },
            ),
        }
        cur.clone()
    }

    /// Admit a node that has no counterpart in `current`, stripping any
    /// parts that policy protects.
    fn admit_new(&mut self, sub: &ValueNode, loc: &Location) -> Option<ValueNode> {
        if self.rules.is_read_only(loc) {
            self.reject(loc, RejectionReason::ReadOnly);
            return None;
        }
        let inside_domain = self
            .rules
            .enum_anchors(loc)
            .iter()
            .any(|anchor| self.current_root.at(anchor).and_then(enum_domain).is_some());
        if inside_domain {
            self.reject(loc, RejectionReason::EnumDomainImmutable);
            return None;
        }
        match sub {
            ValueNode::Map(entries) => Some(ValueNode::Map(
                entries
                    .iter()
                    .filter_map(|(key, child)| {
                        self.admit_new(child, &loc.child(Step::Key(key.clone())))
                            .map(|admitted| (key.clone(), admitted))
                    })
                    .collect(),
            )),
            ValueNode::List(items) => Some(ValueNode::List(
                items
                    .iter()
                    .enumerate()
                    .filter_map(|(i, child)| self.admit_new(child, &loc.child(Step::Index(i))))
                    .collect(),
            )),
            ValueNode::Scalar(_) => Some(sub.clone()),
        }
    }
}
