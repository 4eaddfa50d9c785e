//! Order specifications: sort fields, directions and null placement.
//!
//! Accepted shorthand, all reduced to an ordered list of [`OrderEntry`]:
//! `"x"`, `"rel.x"`, `{"x": "desc"}`, `{"x": {"asc": "nulls_last"}}`,
//! `{"rel": "x"}`, `{"rel": ["x"]}`, `{"rel": {"x": "desc"}}`, and lists of any of these.
//! A string value is a direction when it reads `asc`/`desc`, otherwise a nested field.

use std::fmt;

use metrics::counter;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use sieve_core::{ParamNode, SieveError, SieveResult};
use smallvec::SmallVec;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("asc") {
            Some(Self::Asc)
        } else if s.eq_ignore_ascii_case("desc") {
            Some(Self::Desc)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nulls {
    #[default]
    Unspecified,
    First,
    Last,
}

impl Nulls {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nulls_first" => Some(Self::First),
            "nulls_last" => Some(Self::Last),
            _ => None,
        }
    }
}

/// One sort key. `path` is `[field]` or `[relation, .., field]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderEntry {
    pub path: SmallVec<[String; 2]>,
    pub direction: Direction,
    pub nulls: Nulls,
}

impl OrderEntry {
    /// Ascending entry for a field or dotted `relation.field` path.
    pub fn field(path: &str) -> Self {
        Self { path: split_path(&[], path), direction: Direction::Asc, nulls: Nulls::Unspecified }
    }

    pub fn is_nested(&self) -> bool { self.path.len() > 1 }

    /// Dotted form of the path, e.g. `relation.id`.
    pub fn dotted(&self) -> String { self.path.join(".") }

    /// Compact JSON form: `"x"`, `{"x": "desc"}`, `{"rel": "x"}`, `{"x": {"asc": "nulls_last"}}`.
    pub fn to_value(&self) -> ParamNode {
        let leaf = match (self.direction, self.nulls) {
            (Direction::Asc, Nulls::Unspecified) => None,
            (d, Nulls::Unspecified) => Some(ParamNode::String(d.as_str().to_string())),
            (d, n) => {
                let nulls = if n == Nulls::First { "nulls_first" } else { "nulls_last" };
                let mut m = serde_json::Map::new();
                m.insert(d.as_str().to_string(), ParamNode::String(nulls.to_string()));
                Some(ParamNode::Object(m))
            }
        };
        let (mut value, wrap) = match leaf {
            Some(leaf) => (leaf, &self.path[..]),
            None => match self.path.split_last() {
                Some((last, rest)) => (ParamNode::String(last.clone()), rest),
                None => return ParamNode::Null,
            },
        };
        for seg in wrap.iter().rev() {
            let mut m = serde_json::Map::new();
            m.insert(seg.clone(), value);
            value = ParamNode::Object(m);
        }
        value
    }
}

impl fmt::Display for OrderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.dotted(), self.direction.as_str())?;
        match self.nulls {
            Nulls::First => f.write_str(" nulls first"),
            Nulls::Last => f.write_str(" nulls last"),
            Nulls::Unspecified => Ok(()),
        }
    }
}

/// Sort keys in precedence order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec(Vec<OrderEntry>);

impl OrderSpec {
    pub fn new() -> Self { Self::default() }

    pub fn entries(&self) -> &[OrderEntry] { &self.0 }

    pub fn iter(&self) -> impl Iterator<Item = &OrderEntry> { self.0.iter() }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn push(&mut self, entry: OrderEntry) { self.0.push(entry) }

    pub fn contains_path(&self, dotted: &str) -> bool { self.0.iter().any(|e| e.dotted() == dotted) }

    /// Compact JSON: null when empty, the entry itself when single, a list otherwise.
    pub fn to_value(&self) -> ParamNode {
        match self.0.as_slice() {
            [] => ParamNode::Null,
            [one] => one.to_value(),
            many => ParamNode::Array(many.iter().map(OrderEntry::to_value).collect()),
        }
    }
}

impl FromIterator<OrderEntry> for OrderSpec {
    fn from_iter<I: IntoIterator<Item = OrderEntry>>(iter: I) -> Self { Self(iter.into_iter().collect()) }
}

impl IntoIterator for OrderSpec {
    type Item = OrderEntry;
    type IntoIter = std::vec::IntoIter<OrderEntry>;

    fn into_iter(self) -> Self::IntoIter { self.0.into_iter() }
}

/// Normalize any accepted order shorthand; output order mirrors input order.
pub fn normalize(raw: &ParamNode) -> OrderSpec {
    let mut out = Vec::new();
    collect(raw, &[], &mut out);
    OrderSpec(out)
}

fn split_path(prefix: &[String], dotted: &str) -> SmallVec<[String; 2]> {
    let mut path: SmallVec<[String; 2]> = prefix.iter().cloned().collect();
    path.extend(dotted.split('.').filter(|s| !s.is_empty()).map(str::to_string));
    path
}

/// Direction value: `"asc"`, `{"desc": "nulls_first"}`, or either wrapped in a one-element list.
fn parse_direction(value: &ParamNode) -> Option<(Direction, Nulls)> {
    match value {
        ParamNode::String(s) => Direction::parse(s).map(|d| (d, Nulls::Unspecified)),
        ParamNode::Object(map) if map.len() == 1 => {
            let (k, v) = map.iter().next()?;
            let d = Direction::parse(k)?;
            let n = Nulls::parse(v.as_str()?)?;
            Some((d, n))
        }
        ParamNode::Array(items) if items.len() == 1 => parse_direction(&items[0]),
        _ => None,
    }
}

fn collect(raw: &ParamNode, prefix: &[String], out: &mut Vec<OrderEntry>) {
    match raw {
        ParamNode::String(s) => {
            let path = split_path(prefix, s);
            if path.len() > prefix.len() {
                out.push(OrderEntry { path, direction: Direction::Asc, nulls: Nulls::Unspecified });
            }
        }
        ParamNode::Array(items) => {
            for item in items {
                collect(item, prefix, out);
            }
        }
        ParamNode::Object(map) => {
            for (key, value) in map {
                let path = split_path(prefix, key);
                if path.len() == prefix.len() {
                    continue;
                }
                if let Some((direction, nulls)) = parse_direction(value) {
                    out.push(OrderEntry { path, direction, nulls });
                    continue;
                }
                match value {
                    ParamNode::Null | ParamNode::Bool(true) => {
                        out.push(OrderEntry { path, direction: Direction::Asc, nulls: Nulls::Unspecified })
                    }
                    ParamNode::String(_) | ParamNode::Array(_) | ParamNode::Object(_) => collect(value, &path, out),
                    other => debug!(key = %key, value = %other, "ignoring order value"),
                }
            }
        }
        ParamNode::Null => {}
        other => debug!(value = %other, "ignoring order value"),
    }
}

/// Validate `requested` against `allowed` plus `required`, then append every required
/// field the caller did not already order by.
///
/// A nested entry (`relation.field`) is also permitted when its relation is allowed as a
/// whole. Any unpermitted entry rejects the request.
pub fn sanitize(requested: &OrderSpec, allowed: &OrderSpec, required: &[String]) -> SieveResult<OrderSpec> {
    let mut permitted: FxHashSet<String> = allowed.iter().map(OrderEntry::dotted).collect();
    permitted.extend(required.iter().cloned());

    let mut offending = Vec::new();
    for entry in requested.iter() {
        let dotted = entry.dotted();
        let ok = permitted.contains(&dotted) || (entry.is_nested() && permitted.contains(&entry.path[0]));
        if !ok && !offending.contains(&dotted) {
            offending.push(dotted);
        }
    }
    if !offending.is_empty() {
        debug!(fields = ?offending, "rejecting unpermitted order");
        counter!("sieve_unpermitted_total", offending.len() as u64, "kind" => "order");
        return Err(SieveError::UnpermittedParameters(offending));
    }

    let mut out = requested.clone();
    for field in required {
        if !out.contains_path(field) {
            out.push(OrderEntry::field(field));
        }
    }
    Ok(out)
}

/// [`sanitize`] over raw shorthand.
pub fn sanitize_raw(requested: &ParamNode, allowed: &ParamNode, required: &[String]) -> SieveResult<OrderSpec> {
    sanitize(&normalize(requested), &normalize(allowed), required)
}
