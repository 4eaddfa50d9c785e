//! Which includes can be eagerly preloaded in bulk.
//!
//! Includes carrying modifiers must be queried per record, polymorphic relations cannot
//! be preloaded past their first level, and computed includes are not relations at all.

use std::collections::BTreeMap;

use sieve_schema::RelationResolver;

use crate::includes::IncludeNode;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadTree(BTreeMap<String, PreloadTree>);

impl PreloadTree {
    pub fn get(&self, relation: &str) -> Option<&PreloadTree> { self.0.get(relation) }

    pub fn contains(&self, relation: &str) -> bool { self.0.contains_key(relation) }

    pub fn keys(&self) -> impl Iterator<Item = &str> { self.0.keys().map(String::as_str) }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

pub fn preloadables(includes: &IncludeNode, type_name: &str, resolver: &dyn RelationResolver) -> PreloadTree {
    let mut out = BTreeMap::new();
    for (key, entry) in includes.iter() {
        let Some(spec) = resolver.resolve(type_name, key) else { continue };
        if !entry.modifiers.is_empty() {
            continue;
        }
        if entry.subtree.is_empty() {
            out.insert(key.to_string(), PreloadTree::default());
            continue;
        }
        if let (Some(target), false) = (&spec.target_type, spec.polymorphic) {
            out.insert(key.to_string(), preloadables(&entry.subtree, target, resolver));
        }
    }
    PreloadTree(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::includes::normalize;
    use serde_json::json;
    use sieve_schema::{RelationKind, RelationSpec, SchemaRegistry, TypeSchema};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .register(TypeSchema::new("property"))
            .register(TypeSchema::new("photo"))
            .register(TypeSchema::new("account"))
            .register(TypeSchema::new("reference"))
            .relation("property", RelationSpec::new("photos", RelationKind::OneToMany, "photo", "property_id"))
            .relation("property", RelationSpec::new("landlord", RelationKind::OneToOne, "account", "landlord_id"))
            .relation("photo", RelationSpec::new("account", RelationKind::OneToOne, "account", "account_id"))
            .relation("reference", RelationSpec::polymorphic("subject"))
            .build()
            .unwrap()
    }

    #[test]
    fn plain_relations_preload_recursively() {
        let reg = registry();
        let inc = normalize(&json!({"photos": ["account"], "landlord": true, "english_name": true}));
        let plan = preloadables(&inc, "property", &reg);
        assert_eq!(plan.keys().collect::<Vec<_>>(), vec!["landlord", "photos"]);
        assert!(plan.get("photos").unwrap().contains("account"));
        assert!(plan.get("landlord").unwrap().is_empty());
    }

    #[test]
    fn modifiers_and_polymorphic_subtrees_are_skipped() {
        let reg = registry();
        let inc = normalize(&json!({"photos": {"where": {"id": 1}}, "landlord": true}));
        let plan = preloadables(&inc, "property", &reg);
        assert_eq!(plan.keys().collect::<Vec<_>>(), vec!["landlord"]);
        let plan = preloadables(&normalize(&json!({"photos": {"when": "visible"}})), "property", &reg);
        assert!(plan.is_empty());

        let plan = preloadables(&normalize(&json!("subject")), "reference", &reg);
        assert!(plan.contains("subject"));
        let plan = preloadables(&normalize(&json!({"subject": ["landlord"]})), "reference", &reg);
        assert!(plan.is_empty());
    }
}
