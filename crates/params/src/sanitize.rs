use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use sieve_core::{ParamMap, ParamNode, RecordId, SieveError, SieveResult};
use sieve_schema::{RelationResolver, RelationSpec, SchemaRegistry};
use tracing::debug;

use crate::{NestedRecord, OverrideTable, ParamFilter, RecordFactory, RecordFinder, SanitizedNode, SanitizedValue};

/// Filters a raw attribute/relation tree against the registered type schemas.
pub struct ParamTreeSanitizer<'a, R> {
    registry: &'a SchemaRegistry,
    resolver: &'a dyn RelationResolver,
    finder: &'a dyn RecordFinder<Record = R>,
    factory: &'a dyn RecordFactory<R>,
    overrides: Option<&'a OverrideTable<R>>,
}

impl<'a, R: Clone> ParamTreeSanitizer<'a, R> {
    /// Sanitizer resolving relations through the registry itself.
    pub fn new(
        registry: &'a SchemaRegistry,
        finder: &'a dyn RecordFinder<Record = R>,
        factory: &'a dyn RecordFactory<R>,
    ) -> Self {
        Self { registry, resolver: registry, finder, factory, overrides: None }
    }

    pub fn with_resolver(mut self, resolver: &'a dyn RelationResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_overrides(mut self, overrides: &'a OverrideTable<R>) -> Self {
        self.overrides = (!overrides.is_empty()).then_some(overrides);
        self
    }

    pub fn registry(&self) -> &SchemaRegistry { self.registry }

    /// Sanitize `node` as an instance of `type_name`, honouring a registered type override.
    pub fn sanitize(&self, node: &ParamNode, type_name: &str, allow_id: bool) -> SieveResult<SanitizedNode<R>> {
        match self.overrides.and_then(|o| o.for_type(type_name)) {
            Some(filter) => filter(self, node, allow_id),
            None => self.sanitize_generic(node, type_name, allow_id),
        }
    }

    /// The schema-driven algorithm, ignoring any override for `type_name` itself.
    /// Overrides on nested relations still apply.
    pub fn sanitize_generic(&self, node: &ParamNode, type_name: &str, allow_id: bool) -> SieveResult<SanitizedNode<R>> {
        let schema = self.registry.lookup(type_name)?;
        let mut out = SanitizedNode::new();
        let map = match node {
            ParamNode::Object(map) => map,
            _ => return Ok(out),
        };
        let mut consumed: FxHashSet<String> = FxHashSet::default();

        for (key, value) in map {
            if is_scalar(value) && (schema.permits_attribute(key) || (allow_id && key == "id")) {
                out.insert(key.as_str(), SanitizedValue::Attribute(value.clone()));
                consumed.insert(key.clone());
            }
        }

        for relation in &schema.nested_relations {
            let spec = self.resolver.resolve(type_name, relation).ok_or_else(|| SieveError::UnknownRelation {
                type_name: type_name.to_string(),
                relation: relation.clone(),
            })?;
            self.relation_pass(type_name, &spec, map, &mut out, &mut consumed)?;
        }

        let dropped: Vec<&str> = map.keys().filter(|k| !consumed.contains(*k)).map(String::as_str).collect();
        if !dropped.is_empty() {
            debug!(type_name, keys = ?dropped, "dropping unpermitted keys");
            counter!("sieve_params_dropped_keys_total", dropped.len() as u64, "type" => type_name.to_string());
        }
        Ok(out)
    }

    fn relation_pass(
        &self,
        owner: &str,
        spec: &RelationSpec,
        map: &ParamMap,
        out: &mut SanitizedNode<R>,
        consumed: &mut FxHashSet<String>,
    ) -> SieveResult<()> {
        let ids_key = spec.ids_key();
        let value = match map.get(&spec.name) {
            Some(value) => value,
            None => {
                if spec.is_collection() {
                    if let Some(ids) = map.get(&ids_key) {
                        out.insert(ids_key.as_str(), SanitizedValue::Ids(ids.clone()));
                        consumed.insert(ids_key);
                        return Ok(());
                    }
                }
                if let Some(fk) = map.get(&spec.foreign_key).filter(|v| is_scalar(v)) {
                    out.insert(spec.foreign_key.as_str(), SanitizedValue::ForeignKey(fk.clone()));
                    consumed.insert(spec.foreign_key.clone());
                    if let (true, Some(key)) = (spec.polymorphic, spec.foreign_type_key.as_ref()) {
                        if let Some(ft) = map.get(key).filter(|v| is_scalar(v)) {
                            out.insert(key.as_str(), SanitizedValue::ForeignKey(ft.clone()));
                            consumed.insert(key.clone());
                        }
                    }
                }
                return Ok(());
            }
        };

        // Relation keys left out of `consumed` are reported with the dropped attributes.
        match value {
            ParamNode::Null => out.insert(spec.name.as_str(), SanitizedValue::Cleared),
            ParamNode::Array(items) if items.iter().all(is_pure_id) => {
                let ids = items.iter().filter_map(|item| item.get("id").cloned()).collect();
                out.insert(ids_key, SanitizedValue::Ids(ParamNode::Array(ids)));
            }
            ParamNode::Array(items) if !items.iter().all(ParamNode::is_object) => {
                debug!(owner, relation = %spec.name, "dropping relation list with non-object elements");
                return Ok(());
            }
            ParamNode::Bool(_) | ParamNode::Number(_) | ParamNode::String(_) => {
                debug!(owner, relation = %spec.name, "dropping scalar nested payload");
                return Ok(());
            }
            _ => {
                let Some(target) = spec.target_type.as_deref() else {
                    debug!(owner, relation = %spec.name, "dropping nested payload for polymorphic relation");
                    return Ok(());
                };
                let filter = self
                    .overrides
                    .and_then(|o| o.for_relation(owner, &spec.name).or_else(|| o.for_type(target)));
                let nested = match value {
                    ParamNode::Array(items) => SanitizedValue::Many(self.upsert_many(filter, items, target)?),
                    _ => SanitizedValue::One(self.upsert_one(filter, value, target)?),
                };
                out.insert(spec.name.as_str(), nested);
            }
        }
        consumed.insert(spec.name.clone());
        Ok(())
    }

    fn sanitize_nested(&self, filter: Option<&ParamFilter<R>>, node: &ParamNode, target: &str) -> SieveResult<SanitizedNode<R>> {
        match filter {
            Some(f) => f(self, node, true),
            None => self.sanitize_generic(node, target, true),
        }
    }

    fn upsert_one(&self, filter: Option<&ParamFilter<R>>, node: &ParamNode, target: &str) -> SieveResult<NestedRecord<R>> {
        let attrs = self.sanitize_nested(filter, node, target)?;
        match attrs.id() {
            Some(id) => {
                let mut found = self.find(target, std::slice::from_ref(&id))?;
                let record = found.remove(&id);
                Ok(NestedRecord::ExistingRecordMerge { id, record, attrs })
            }
            None => self.build(target, attrs),
        }
    }

    /// Sanitize every element, then resolve all ids with a single finder call.
    fn upsert_many(&self, filter: Option<&ParamFilter<R>>, items: &[ParamNode], target: &str) -> SieveResult<Vec<NestedRecord<R>>> {
        let sanitized = items
            .iter()
            .map(|item| self.sanitize_nested(filter, item, target))
            .collect::<SieveResult<Vec<_>>>()?;

        let mut ids: Vec<RecordId> = Vec::new();
        for id in sanitized.iter().filter_map(SanitizedNode::id) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        let found = if ids.is_empty() { FxHashMap::default() } else { self.find(target, &ids)? };

        sanitized
            .into_iter()
            .map(|attrs| match attrs.id() {
                Some(id) => {
                    let record = found.get(&id).cloned();
                    Ok(NestedRecord::ExistingRecordMerge { id, record, attrs })
                }
                None => self.build(target, attrs),
            })
            .collect()
    }

    fn find(&self, target: &str, ids: &[RecordId]) -> SieveResult<FxHashMap<RecordId, R>> {
        counter!("sieve_record_lookups_total", 1u64, "type" => target.to_string());
        let records = self.finder.find_by_ids(target, ids).map_err(SieveError::collaborator)?;
        if records.len() < ids.len() {
            debug!(type_name = target, requested = ids.len(), found = records.len(), "records missing; deferring to persistence");
        }
        Ok(records
            .into_iter()
            .filter_map(|r| self.finder.record_id(&r).map(|id| (id, r)))
            .collect())
    }

    fn build(&self, target: &str, attrs: SanitizedNode<R>) -> SieveResult<NestedRecord<R>> {
        let record = self.factory.build(target, &attrs).map_err(SieveError::collaborator)?;
        Ok(NestedRecord::NewRecord { record, attrs })
    }
}

/// Plain attribute values: scalars and null, never maps or lists.
fn is_scalar(node: &ParamNode) -> bool { !(node.is_object() || node.is_array()) }

/// A map whose only key is `id`.
fn is_pure_id(node: &ParamNode) -> bool {
    match node {
        ParamNode::Object(map) => map.len() == 1 && map.contains_key("id"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRecords;
    use serde_json::json;
    use sieve_schema::{RelationKind, TypeSchema};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .register(TypeSchema::new("property").attributes(["name", "landlord_id"]).nested(["photos", "landlord", "accounts"]))
            .register(TypeSchema::new("photo").attributes(["format"]).nested(["subject"]))
            .register(TypeSchema::new("account").attributes(["name"]))
            .relation("property", RelationSpec::new("photos", RelationKind::OneToMany, "photo", "property_id"))
            .relation("property", RelationSpec::new("landlord", RelationKind::OneToOne, "account", "landlord_id"))
            .relation("property", RelationSpec::new("accounts", RelationKind::ManyToMany, "account", "property_id"))
            .relation("photo", RelationSpec::polymorphic("subject"))
            .build()
            .unwrap()
    }

    #[test]
    fn unknown_attributes_are_dropped() {
        let reg = registry();
        let store = MemoryRecords::new();
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        let out = s.sanitize(&json!({"name": "a", "secret": "b", "id": 3}), "property", false).unwrap();
        assert_eq!(out.to_value(), json!({"name": "a"}));
        let out = s.sanitize(&json!({"name": "a", "id": 3}), "property", true).unwrap();
        assert_eq!(out.to_value(), json!({"name": "a", "id": 3}));
    }

    #[test]
    fn null_and_non_object_input_yield_empty_node() {
        let reg = registry();
        let store = MemoryRecords::new();
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        assert!(s.sanitize(&json!(null), "property", false).unwrap().is_empty());
        assert!(s.sanitize(&json!([1, 2]), "property", false).unwrap().is_empty());
    }

    #[test]
    fn structured_values_under_attributes_are_dropped() {
        let reg = registry();
        let store = MemoryRecords::new();
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        let out = s
            .sanitize(&json!({"name": {"admin": true, "role": "root"}, "landlord_id": [1, 2]}), "property", false)
            .unwrap();
        assert!(out.is_empty());
        let out = s.sanitize(&json!({"name": null, "landlord_id": 4}), "property", false).unwrap();
        assert_eq!(out.to_value(), json!({"name": null, "landlord_id": 4}));
    }

    #[test]
    fn scalar_relation_payloads_leave_relation_untouched() {
        let reg = registry();
        let store = MemoryRecords::new();
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        let out = s.sanitize(&json!({"photos": [1, 2], "name": "a"}), "property", false).unwrap();
        assert_eq!(out.to_value(), json!({"name": "a"}));
        assert!(!out.contains_key("photos"));

        let out = s.sanitize(&json!({"photos": [{"format": "png"}, 3], "landlord": 7}), "property", false).unwrap();
        assert!(out.is_empty());
        assert_eq!(store.lookups(), 0);

        let out = s.sanitize(&json!({"photos": []}), "property", false).unwrap();
        assert_eq!(out.to_value(), json!({"photo_ids": []}));
    }

    /// Resolves `property.photos` under a custom singular, everything else through the registry.
    struct RenamingResolver<'a>(&'a SchemaRegistry);

    impl RelationResolver for RenamingResolver<'_> {
        fn resolve(&self, type_name: &str, relation: &str) -> Option<RelationSpec> {
            let mut spec = self.0.resolve(type_name, relation)?;
            if type_name == "property" && relation == "photos" {
                spec.singular = "picture".to_string();
            }
            Some(spec)
        }
    }

    #[test]
    fn relations_resolve_through_supplied_resolver() {
        let reg = registry();
        let store = MemoryRecords::new();
        let resolver = RenamingResolver(&reg);
        let s = ParamTreeSanitizer::new(&reg, &store, &store).with_resolver(&resolver);
        let out = s.sanitize(&json!({"photos": [{"id": 1}], "picture_ids": [9]}), "property", false).unwrap();
        assert_eq!(out.to_value(), json!({"picture_ids": [1]}));
        let out = s.sanitize(&json!({"picture_ids": [9], "photo_ids": [8]}), "property", false).unwrap();
        assert_eq!(out.to_value(), json!({"picture_ids": [9]}));
    }

    #[test]
    fn unknown_type_fails_fast() {
        let reg = registry();
        let store = MemoryRecords::new();
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        assert!(matches!(s.sanitize(&json!({}), "listing", false), Err(SieveError::UnknownType(t)) if t == "listing"));
    }

    #[test]
    fn pure_id_list_collapses_without_lookup() {
        let reg = registry();
        let store = MemoryRecords::new();
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        let out = s.sanitize(&json!({"photos": [{"id": 1}, {"id": 2}]}), "property", false).unwrap();
        assert_eq!(out.to_value(), json!({"photo_ids": [1, 2]}));
        assert!(matches!(out.get("photo_ids"), Some(SanitizedValue::Ids(_))));
        assert_eq!(store.lookups(), 0);
    }

    #[test]
    fn ids_shortcut_and_foreign_key_pass_through() {
        let reg = registry();
        let store = MemoryRecords::new();
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        let out = s
            .sanitize(&json!({"photo_ids": [4, 5], "account_ids": "junk", "landlord_id": 9}), "property", false)
            .unwrap();
        assert_eq!(out.get("photo_ids"), Some(&SanitizedValue::Ids(json!([4, 5]))));
        assert_eq!(out.get("account_ids"), Some(&SanitizedValue::Ids(json!("junk"))));
        assert_eq!(out.get("landlord_id"), Some(&SanitizedValue::ForeignKey(json!(9))));
    }

    #[test]
    fn polymorphic_foreign_key_carries_type() {
        let reg = registry();
        let store = MemoryRecords::new();
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        let out = s
            .sanitize(&json!({"subject_id": 2, "subject_type": "Property", "subject": null}), "photo", false)
            .unwrap();
        assert_eq!(out.get("subject"), Some(&SanitizedValue::Cleared));
        assert!(!out.contains_key("subject_id"));

        let out = s.sanitize(&json!({"subject_id": 2, "subject_type": "Property"}), "photo", false).unwrap();
        assert_eq!(out.to_value(), json!({"subject_id": 2, "subject_type": "Property"}));

        let out = s.sanitize(&json!({"subject": {"name": "x"}}), "photo", false).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn nested_upsert_merges_existing_and_builds_new() {
        let reg = registry();
        let store = MemoryRecords::new().with_record("photo", json!({"id": 5, "format": "png"}));
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        let out = s
            .sanitize(
                &json!({"photos": [{"id": 5, "format": "jpg", "bogus": 1}, {"format": "tiff"}, {"id": 6}]}),
                "property",
                false,
            )
            .unwrap();
        let Some(SanitizedValue::Many(records)) = out.get("photos") else { panic!("expected nested photos") };
        assert_eq!(records.len(), 3);
        match &records[0] {
            NestedRecord::ExistingRecordMerge { id, record, attrs } => {
                assert_eq!(*id, RecordId::Int(5));
                assert_eq!(record.as_ref(), Some(&json!({"id": 5, "format": "png"})));
                assert_eq!(attrs.to_value(), json!({"id": 5, "format": "jpg"}));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&records[1], NestedRecord::NewRecord { record, .. } if *record == json!({"format": "tiff"})));
        assert!(matches!(&records[2], NestedRecord::ExistingRecordMerge { record: None, .. }));
        assert_eq!(store.lookups(), 1);
    }

    #[test]
    fn nested_single_object() {
        let reg = registry();
        let store = MemoryRecords::new().with_record("account", json!({"id": 1, "name": "old"}));
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        let out = s.sanitize(&json!({"landlord": {"id": 1, "name": "new"}}), "property", false).unwrap();
        let Some(SanitizedValue::One(rec)) = out.get("landlord") else { panic!("expected landlord") };
        assert!(rec.is_existing());
        assert_eq!(rec.attrs().to_value(), json!({"id": 1, "name": "new"}));

        let out = s.sanitize(&json!({"landlord": {"name": "fresh"}}), "property", false).unwrap();
        assert!(matches!(out.get("landlord"), Some(SanitizedValue::One(NestedRecord::NewRecord { .. }))));
    }

    #[test]
    fn finder_errors_propagate() {
        let reg = registry();
        let store = MemoryRecords::new().failing("account");
        let s = ParamTreeSanitizer::new(&reg, &store, &store);
        let err = s.sanitize(&json!({"landlord": {"id": 1}}), "property", false).unwrap_err();
        assert!(matches!(err, SieveError::Collaborator(_)));
        assert!(err.to_string().contains("account"));
    }

    #[test]
    fn relation_override_takes_precedence() {
        let reg = registry();
        let store = MemoryRecords::new();
        let overrides = OverrideTable::new()
            .on_type("account", |_s: &ParamTreeSanitizer<'_, serde_json::Value>, _n: &ParamNode, _id: bool| {
                let mut out = SanitizedNode::new();
                out.insert("name", SanitizedValue::Attribute(json!("by-type")));
                Ok(out)
            })
            .on_relation("property", "landlord", |s: &ParamTreeSanitizer<'_, serde_json::Value>, n: &ParamNode, id: bool| {
                let mut out = s.sanitize_generic(n, "account", id)?;
                out.insert("name", SanitizedValue::Attribute(json!("by-relation")));
                Ok(out)
            });
        let s = ParamTreeSanitizer::new(&reg, &store, &store).with_overrides(&overrides);
        let out = s
            .sanitize(&json!({"landlord": {"name": "x"}, "accounts": [{"name": "y"}]}), "property", false)
            .unwrap();
        assert_eq!(out.to_value(), json!({"landlord": {"name": "by-relation"}, "accounts": [{"name": "by-type"}]}));
        assert_eq!(s.sanitize(&json!({}), "account", false).unwrap().to_value(), json!({"name": "by-type"}));
    }
}
