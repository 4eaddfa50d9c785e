//! Include trees: which related records to attach to a response.
//!
//! All shorthand forms reduce to one canonical [`IncludeNode`]:
//!
//! ```text
//! "x" | ["x"] | {"x": true} | [{"x": true}]   =>  {x: {}}
//! {"x": ["y"]} | {"x": {"y": true}} | {"x": "y"}  =>  {x: {y: {}}}
//! {"x": {"where": {...}, "limit": 5}}            =>  {x: {} + modifiers}
//! ```

use std::collections::BTreeMap;

use metrics::counter;
use sieve_core::{ParamNode, SieveError, SieveResult};
use tracing::debug;

/// Per-relation query modifiers; reserved names that are never relation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modifier {
    Where,
    Order,
    Limit,
    Offset,
    Distinct,
    When,
}

impl Modifier {
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "where" => Some(Self::Where),
            "order" => Some(Self::Order),
            "limit" => Some(Self::Limit),
            "offset" => Some(Self::Offset),
            "distinct" => Some(Self::Distinct),
            "when" => Some(Self::When),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Where => "where",
            Self::Order => "order",
            Self::Limit => "limit",
            Self::Offset => "offset",
            Self::Distinct => "distinct",
            Self::When => "when",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncludeEntry {
    pub subtree: IncludeNode,
    /// Opaque modifier values, passed to the query builder untouched.
    pub modifiers: BTreeMap<Modifier, ParamNode>,
}

impl IncludeEntry {
    /// Merge `other` into `self`: subtrees union recursively, modifiers last-write-wins.
    pub fn merge(&mut self, other: IncludeEntry) {
        self.subtree.merge(other.subtree);
        self.modifiers.extend(other.modifiers);
    }
}

/// Canonical include tree. Keys are kept sorted, so equality ignores input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncludeNode(BTreeMap<String, IncludeEntry>);

impl IncludeNode {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, relation: &str) -> Option<&IncludeEntry> { self.0.get(relation) }

    pub fn contains(&self, relation: &str) -> bool { self.0.contains_key(relation) }

    pub fn keys(&self) -> impl Iterator<Item = &str> { self.0.keys().map(String::as_str) }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &IncludeEntry)> { self.0.iter().map(|(k, v)| (k.as_str(), v)) }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn insert(&mut self, relation: impl Into<String>, entry: IncludeEntry) {
        let relation = relation.into();
        match self.0.get_mut(&relation) {
            Some(existing) => existing.merge(entry),
            None => {
                self.0.insert(relation, entry);
            }
        }
    }

    pub fn merge(&mut self, other: IncludeNode) {
        for (k, v) in other.0 {
            self.insert(k, v);
        }
    }

    /// JSON rendering of the canonical form; `normalize(to_value(n)) == n`.
    pub fn to_value(&self) -> ParamNode {
        let mut map = serde_json::Map::new();
        for (k, entry) in &self.0 {
            let mut inner = match entry.subtree.to_value() {
                ParamNode::Object(m) => m,
                _ => serde_json::Map::new(),
            };
            for (m, v) in &entry.modifiers {
                inner.insert(m.as_str().to_string(), v.clone());
            }
            map.insert(k.clone(), ParamNode::Object(inner));
        }
        ParamNode::Object(map)
    }
}

/// Normalize any accepted include shorthand into canonical form.
pub fn normalize(raw: &ParamNode) -> IncludeNode {
    let mut node = IncludeNode::new();
    merge_raw(&mut node, raw);
    node
}

fn merge_raw(node: &mut IncludeNode, raw: &ParamNode) {
    match raw {
        ParamNode::String(name) if !name.is_empty() => node.insert(name.as_str(), IncludeEntry::default()),
        ParamNode::Array(items) => {
            for item in items {
                merge_raw(node, item);
            }
        }
        ParamNode::Object(map) => {
            for (key, value) in map {
                if Modifier::parse(key).is_some() {
                    debug!(key = %key, "ignoring include modifier outside a relation");
                    continue;
                }
                if let Some(entry) = entry_from(value) {
                    node.insert(key.as_str(), entry);
                }
            }
        }
        ParamNode::Null => {}
        other => debug!(value = %other, "ignoring include value"),
    }
}

/// Entry for a relation's value, or `None` when the value switches the include off.
fn entry_from(value: &ParamNode) -> Option<IncludeEntry> {
    match value {
        ParamNode::Bool(true) => Some(IncludeEntry::default()),
        ParamNode::Bool(false) | ParamNode::Null => None,
        // Decoded query strings carry booleans as text.
        ParamNode::String(s) if s == "true" => Some(IncludeEntry::default()),
        ParamNode::String(s) if s == "false" => None,
        ParamNode::String(_) | ParamNode::Array(_) => Some(IncludeEntry { subtree: normalize(value), modifiers: BTreeMap::new() }),
        ParamNode::Object(map) => {
            let mut entry = IncludeEntry::default();
            for (key, v) in map {
                match Modifier::parse(key) {
                    Some(m) => {
                        entry.modifiers.insert(m, v.clone());
                    }
                    None => {
                        if let Some(child) = entry_from(v) {
                            entry.subtree.insert(key.as_str(), child);
                        }
                    }
                }
            }
            Some(entry)
        }
        ParamNode::Number(_) => None,
    }
}

/// Check `requested` against `allowed`, level by level. Any requested relation missing
/// from the allowed tree rejects the whole request, naming every offender by its dotted path.
pub fn sanitize(requested: &IncludeNode, allowed: &IncludeNode) -> SieveResult<IncludeNode> {
    let mut offending = Vec::new();
    let out = sanitize_level(requested, allowed, None, &mut offending);
    if !offending.is_empty() {
        debug!(keys = ?offending, "rejecting unpermitted includes");
        counter!("sieve_unpermitted_total", offending.len() as u64, "kind" => "include");
        return Err(SieveError::UnpermittedParameters(offending));
    }
    Ok(out)
}

/// [`sanitize`] over raw shorthand; both sides are normalized first.
pub fn sanitize_raw(requested: &ParamNode, allowed: &ParamNode) -> SieveResult<IncludeNode> {
    sanitize(&normalize(requested), &normalize(allowed))
}

fn sanitize_level(requested: &IncludeNode, allowed: &IncludeNode, prefix: Option<&str>, offending: &mut Vec<String>) -> IncludeNode {
    let mut out = IncludeNode::new();
    for (key, entry) in requested.iter() {
        let path = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key.to_string(),
        };
        match allowed.get(key) {
            Some(permitted) => {
                let subtree = sanitize_level(&entry.subtree, &permitted.subtree, Some(&path), offending);
                out.insert(key, IncludeEntry { subtree, modifiers: entry.modifiers.clone() });
            }
            None => offending.push(path),
        }
    }
    out
}
