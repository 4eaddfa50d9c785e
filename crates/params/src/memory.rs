//! In-memory record store over JSON objects, for tests and the CLI.

use std::sync::atomic::{AtomicUsize, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};
use sieve_core::{BoxError, ParamNode, RecordId};

use crate::{RecordFactory, RecordFinder, SanitizedNode};

/// Records keyed by type name; a record's id is its `id` field.
#[derive(Debug, Default)]
pub struct MemoryRecords {
    records: FxHashMap<String, Vec<ParamNode>>,
    failing: FxHashSet<String>,
    lookups: AtomicUsize,
}

impl MemoryRecords {
    pub fn new() -> Self { Self::default() }

    pub fn with_record(mut self, type_name: &str, record: ParamNode) -> Self {
        self.records.entry(type_name.to_string()).or_default().push(record);
        self
    }

    /// Make every lookup of `type_name` fail, as a broken backend would.
    pub fn failing(mut self, type_name: &str) -> Self {
        self.failing.insert(type_name.to_string());
        self
    }

    /// Number of `find_by_ids` calls served so far.
    pub fn lookups(&self) -> usize { self.lookups.load(Ordering::Relaxed) }
}

impl RecordFinder for MemoryRecords {
    type Record = ParamNode;

    fn find_by_ids(&self, type_name: &str, ids: &[RecordId]) -> Result<Vec<ParamNode>, BoxError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if self.failing.contains(type_name) {
            return Err(format!("lookup of {} records failed", type_name).into());
        }
        let Some(rows) = self.records.get(type_name) else { return Ok(Vec::new()) };
        Ok(rows
            .iter()
            .filter(|r| self.record_id(r).is_some_and(|id| ids.contains(&id)))
            .cloned()
            .collect())
    }

    fn record_id(&self, record: &ParamNode) -> Option<RecordId> {
        record.get("id").and_then(RecordId::from_param)
    }
}

impl RecordFactory<ParamNode> for MemoryRecords {
    fn build(&self, _type_name: &str, attrs: &SanitizedNode<ParamNode>) -> Result<ParamNode, BoxError> {
        Ok(attrs.to_value())
    }
}
