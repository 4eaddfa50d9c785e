//! Sieve params: write-side sanitization of nested attribute/relation trees.
//!
//! Unknown attributes are dropped; declared nested relations are sanitized recursively
//! and resolved to existing records (by id, batched per relation) or built as new ones.

#![forbid(unsafe_code)]

use std::sync::Arc;

use rustc_hash::FxHashMap;
use sieve_core::{BoxError, ParamNode, RecordId, SieveResult};

pub mod memory;
mod sanitize;

pub use memory::MemoryRecords;
pub use sanitize::ParamTreeSanitizer;

/// Looks up persisted records for upsert-merge resolution.
pub trait RecordFinder: Send + Sync {
    type Record;

    /// Fetch every record of `type_name` among `ids`. Missing ids simply yield fewer
    /// records; the caller defers not-found handling to persistence.
    fn find_by_ids(&self, type_name: &str, ids: &[RecordId]) -> Result<Vec<Self::Record>, BoxError>;

    fn record_id(&self, record: &Self::Record) -> Option<RecordId>;
}

/// Builds an unsaved record for a nested element without an id.
pub trait RecordFactory<R>: Send + Sync {
    fn build(&self, type_name: &str, attrs: &SanitizedNode<R>) -> Result<R, BoxError>;
}

/// One sanitized value, tagged with the rule that admitted its key.
#[derive(Debug, Clone, PartialEq)]
pub enum SanitizedValue<R> {
    /// Whitelisted attribute (or `id` when ids are allowed).
    Attribute(ParamNode),
    /// `<singular>_ids` collection shortcut.
    Ids(ParamNode),
    /// Foreign key or polymorphic foreign type passed through verbatim.
    ForeignKey(ParamNode),
    /// Relation explicitly set to null by the client.
    Cleared,
    One(NestedRecord<R>),
    Many(Vec<NestedRecord<R>>),
}

/// A nested relation element after upsert resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedRecord<R> {
    /// Element carried an id. `record` is `None` when the finder did not return it;
    /// persistence reports the missing record.
    ExistingRecordMerge { id: RecordId, record: Option<R>, attrs: SanitizedNode<R> },
    NewRecord { record: R, attrs: SanitizedNode<R> },
}

impl<R> NestedRecord<R> {
    pub fn attrs(&self) -> &SanitizedNode<R> {
        match self {
            Self::ExistingRecordMerge { attrs, .. } | Self::NewRecord { attrs, .. } => attrs,
        }
    }

    pub fn is_existing(&self) -> bool { matches!(self, Self::ExistingRecordMerge { .. }) }
}

/// Ordered map of permitted keys to sanitized values.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedNode<R> {
    fields: Vec<(String, SanitizedValue<R>)>,
}

impl<R> Default for SanitizedNode<R> {
    fn default() -> Self { Self { fields: Vec::new() } }
}

impl<R> SanitizedNode<R> {
    pub fn new() -> Self { Self::default() }

    /// Insert or replace `key`, keeping the position of an existing entry.
    pub fn insert(&mut self, key: impl Into<String>, value: SanitizedValue<R>) {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&SanitizedValue<R>> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<SanitizedValue<R>> {
        let idx = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool { self.get(key).is_some() }

    pub fn keys(&self) -> impl Iterator<Item = &str> { self.fields.iter().map(|(k, _)| k.as_str()) }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SanitizedValue<R>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize { self.fields.len() }

    pub fn is_empty(&self) -> bool { self.fields.is_empty() }

    /// Id carried by the `id` attribute, if any.
    pub fn id(&self) -> Option<RecordId> {
        match self.get("id") {
            Some(SanitizedValue::Attribute(v)) => RecordId::from_param(v),
            _ => None,
        }
    }

    /// Plain JSON rendering for handing to a persistence layer or printing.
    pub fn to_value(&self) -> ParamNode {
        let mut map = serde_json::Map::with_capacity(self.fields.len());
        for (k, v) in &self.fields {
            let rendered = match v {
                SanitizedValue::Attribute(x) | SanitizedValue::Ids(x) | SanitizedValue::ForeignKey(x) => x.clone(),
                SanitizedValue::Cleared => ParamNode::Null,
                SanitizedValue::One(rec) => rec.attrs().to_value(),
                SanitizedValue::Many(recs) => ParamNode::Array(recs.iter().map(|r| r.attrs().to_value()).collect()),
            };
            map.insert(k.clone(), rendered);
        }
        ParamNode::Object(map)
    }
}

/// Custom sanitizer for a type or a single relation. Receives the running sanitizer
/// so it can fall back to [`ParamTreeSanitizer::sanitize_generic`].
pub type ParamFilter<R> =
    Arc<dyn Fn(&ParamTreeSanitizer<'_, R>, &ParamNode, bool) -> SieveResult<SanitizedNode<R>> + Send + Sync>;

/// Static override table, built once at startup.
///
/// A `(owner type, relation)` entry wins over a target-type entry, which wins over the
/// generic algorithm. Type entries also apply to the root type.
pub struct OverrideTable<R> {
    by_type: FxHashMap<String, ParamFilter<R>>,
    by_relation: FxHashMap<(String, String), ParamFilter<R>>,
}

impl<R> Default for OverrideTable<R> {
    fn default() -> Self { Self { by_type: FxHashMap::default(), by_relation: FxHashMap::default() } }
}

impl<R> OverrideTable<R> {
    pub fn new() -> Self { Self::default() }

    pub fn on_type<F>(mut self, type_name: &str, f: F) -> Self
    where
        F: Fn(&ParamTreeSanitizer<'_, R>, &ParamNode, bool) -> SieveResult<SanitizedNode<R>> + Send + Sync + 'static,
    {
        self.by_type.insert(type_name.to_string(), Arc::new(f));
        self
    }

    pub fn on_relation<F>(mut self, owner: &str, relation: &str, f: F) -> Self
    where
        F: Fn(&ParamTreeSanitizer<'_, R>, &ParamNode, bool) -> SieveResult<SanitizedNode<R>> + Send + Sync + 'static,
    {
        self.by_relation.insert((owner.to_string(), relation.to_string()), Arc::new(f));
        self
    }

    pub fn for_type(&self, type_name: &str) -> Option<&ParamFilter<R>> { self.by_type.get(type_name) }

    pub fn for_relation(&self, owner: &str, relation: &str) -> Option<&ParamFilter<R>> {
        self.by_relation.get(&(owner.to_string(), relation.to_string()))
    }

    pub fn is_empty(&self) -> bool { self.by_type.is_empty() && self.by_relation.is_empty() }
}
