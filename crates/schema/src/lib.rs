//! Sieve schema: per-type whitelists, declared relations and the read-only registry.
//!
//! The registry is built once at startup (in code or from a [`config::SchemaConfig`])
//! and shared behind an `Arc`; nothing mutates it afterwards.

#![forbid(unsafe_code)]

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sieve_core::inflect;
use sieve_core::{ParamNode, SieveError, SieveResult};
use tracing::debug;

pub mod config;

pub use config::SchemaConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    #[serde(alias = "belongs_to", alias = "has_one")]
    OneToOne,
    #[serde(alias = "has_many")]
    OneToMany,
    #[serde(alias = "has_and_belongs_to_many", alias = "habtm")]
    ManyToMany,
}

impl RelationKind {
    pub fn is_collection(self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }
}

/// A declared relation between two entity types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub name: String,
    pub kind: RelationKind,
    /// Target entity type; `None` only for polymorphic relations, whose target is
    /// carried per record in `foreign_type_key`.
    pub target_type: Option<String>,
    pub foreign_key: String,
    pub foreign_type_key: Option<String>,
    pub polymorphic: bool,
    /// Singular form of `name`, used for the `<singular>_ids` shortcut key.
    pub singular: String,
}

impl RelationSpec {
    pub fn new(name: &str, kind: RelationKind, target_type: &str, foreign_key: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            target_type: Some(target_type.to_string()),
            foreign_key: foreign_key.to_string(),
            foreign_type_key: None,
            polymorphic: false,
            singular: inflect::singularize(name),
        }
    }

    /// Polymorphic to-one relation: `<name>_id` plus `<name>_type`.
    pub fn polymorphic(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: RelationKind::OneToOne,
            target_type: None,
            foreign_key: format!("{}_id", name),
            foreign_type_key: Some(format!("{}_type", name)),
            polymorphic: true,
            singular: name.to_string(),
        }
    }

    pub fn is_collection(&self) -> bool { self.kind.is_collection() }

    pub fn ids_key(&self) -> String { inflect::ids_key(&self.singular) }
}

/// Whitelist for one entity type.
#[derive(Debug, Clone, Default)]
pub struct TypeSchema {
    pub name: String,
    pub attributes: FxHashSet<String>,
    /// Relations accepted as nested payloads, in declaration order.
    pub nested_relations: Vec<String>,
    /// Raw include whitelist; normalized by the include sanitizer on use.
    pub includes: ParamNode,
    /// Raw order whitelist; normalized by the order sanitizer on use.
    pub orders: ParamNode,
    /// Fields always appended to a requested order unless already present.
    pub required_orders: Vec<String>,
    /// Order used when a request carries none.
    pub default_order: Option<ParamNode>,
}

impl TypeSchema {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Self::default() }
    }

    pub fn attributes<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes.extend(attrs.into_iter().map(Into::into));
        self
    }

    pub fn nested<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for r in relations {
            let r = r.into();
            if !self.nested_relations.contains(&r) {
                self.nested_relations.push(r);
            }
        }
        self
    }

    pub fn includes(mut self, includes: ParamNode) -> Self {
        self.includes = includes;
        self
    }

    pub fn orders(mut self, orders: ParamNode) -> Self {
        self.orders = orders;
        self
    }

    pub fn required_orders<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_orders = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_order(mut self, order: ParamNode) -> Self {
        self.default_order = Some(order);
        self
    }

    pub fn permits_attribute(&self, key: &str) -> bool { self.attributes.contains(key) }
}

/// Name of the synthetic join type of a many-to-many relation: both type names sorted
/// and joined with `_` (`property` + `account` → `account_property`).
pub fn habtm_join_name(a: &str, b: &str) -> String {
    let mut names = [a, b];
    names.sort_unstable();
    names.join("_")
}

/// Resolves a relation name on a type to its declared spec.
pub trait RelationResolver: Send + Sync {
    fn resolve(&self, type_name: &str, relation: &str) -> Option<RelationSpec>;
}

/// Process-wide, read-only map of type name to schema and declared relations.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    types: FxHashMap<String, TypeSchema>,
    relations: FxHashMap<String, FxHashMap<String, RelationSpec>>,
}

impl SchemaRegistry {
    pub fn builder() -> RegistryBuilder { RegistryBuilder::default() }

    /// Schema for `type_name`. An unregistered name is a configuration error.
    pub fn lookup(&self, type_name: &str) -> SieveResult<&TypeSchema> {
        self.types
            .get(type_name)
            .ok_or_else(|| SieveError::UnknownType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool { self.types.contains_key(type_name) }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn relation(&self, type_name: &str, relation: &str) -> Option<&RelationSpec> {
        self.relations.get(type_name)?.get(relation)
    }
}

impl RelationResolver for SchemaRegistry {
    fn resolve(&self, type_name: &str, relation: &str) -> Option<RelationSpec> {
        self.relation(type_name, relation).cloned()
    }
}

/// Collects schemas and relations, then validates them into a [`SchemaRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: Vec<TypeSchema>,
    relations: Vec<(String, RelationSpec)>,
}

impl RegistryBuilder {
    pub fn register(mut self, schema: TypeSchema) -> Self {
        self.types.push(schema);
        self
    }

    pub fn relation(mut self, type_name: &str, spec: RelationSpec) -> Self {
        self.relations.push((type_name.to_string(), spec));
        self
    }

    /// Register the join type of a many-to-many relation between `a` and `b`, with a
    /// to-one relation back to each side. `extra` lists additional join attributes.
    pub fn habtm_join<I, S>(mut self, a: &str, b: &str, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = habtm_join_name(a, b);
        let schema = TypeSchema::new(&name)
            .attributes([format!("{}_id", a), format!("{}_id", b)])
            .attributes(extra);
        self.types.push(schema);
        for side in [a, b] {
            let spec = RelationSpec::new(side, RelationKind::OneToOne, side, &format!("{}_id", side));
            self.relations.push((name.clone(), spec));
        }
        self
    }

    pub fn build(self) -> SieveResult<SchemaRegistry> {
        let mut reg = SchemaRegistry::default();
        for schema in self.types {
            if reg.types.contains_key(&schema.name) {
                return Err(SieveError::InvalidSchema(format!("type `{}` registered twice", schema.name)));
            }
            reg.types.insert(schema.name.clone(), schema);
        }
        for (owner, spec) in self.relations {
            if !reg.types.contains_key(&owner) {
                return Err(SieveError::UnknownType(owner));
            }
            match (&spec.target_type, spec.polymorphic) {
                (Some(target), _) if !reg.types.contains_key(target) => {
                    return Err(SieveError::UnknownType(target.clone()));
                }
                (None, false) => {
                    return Err(SieveError::InvalidSchema(format!(
                        "relation `{}` on `{}` has no target type", spec.name, owner
                    )));
                }
                _ => {}
            }
            reg.relations.entry(owner).or_default().insert(spec.name.clone(), spec);
        }
        for schema in reg.types.values() {
            for rel in &schema.nested_relations {
                if reg.relation(&schema.name, rel).is_none() {
                    return Err(SieveError::UnknownRelation {
                        type_name: schema.name.clone(),
                        relation: rel.clone(),
                    });
                }
            }
        }
        debug!(types = reg.types.len(), "schema registry built");
        Ok(reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .register(TypeSchema::new("property").attributes(["name"]).nested(["photos"]))
            .register(TypeSchema::new("photo").attributes(["format"]))
            .relation("property", RelationSpec::new("photos", RelationKind::OneToMany, "photo", "property_id"))
            .build()
            .unwrap()
    }

    #[test]
    fn lookup_and_resolve() {
        let reg = registry();
        assert!(reg.lookup("property").unwrap().permits_attribute("name"));
        assert!(matches!(reg.lookup("nope"), Err(SieveError::UnknownType(t)) if t == "nope"));
        let spec = reg.resolve("property", "photos").unwrap();
        assert!(spec.is_collection());
        assert_eq!(spec.ids_key(), "photo_ids");
        assert!(reg.resolve("photo", "photos").is_none());
    }

    #[test]
    fn nested_relation_must_be_declared() {
        let err = SchemaRegistry::builder()
            .register(TypeSchema::new("property").nested(["photos"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, SieveError::UnknownRelation { relation, .. } if relation == "photos"));
    }

    #[test]
    fn relation_target_must_be_registered() {
        let err = SchemaRegistry::builder()
            .register(TypeSchema::new("property"))
            .relation("property", RelationSpec::new("landlord", RelationKind::OneToOne, "account", "landlord_id"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SieveError::UnknownType(t) if t == "account"));
    }

    #[test]
    fn habtm_join_type_is_named_by_sorted_sides() {
        assert_eq!(habtm_join_name("property", "account"), "account_property");
        assert_eq!(habtm_join_name("account", "property"), "account_property");
        let reg = SchemaRegistry::builder()
            .register(TypeSchema::new("property"))
            .register(TypeSchema::new("account"))
            .habtm_join("property", "account", ["role"])
            .build()
            .unwrap();
        let join = reg.lookup("account_property").unwrap();
        assert!(join.permits_attribute("account_id"));
        assert!(join.permits_attribute("property_id"));
        assert!(join.permits_attribute("role"));
        assert_eq!(reg.resolve("account_property", "account").unwrap().foreign_key, "account_id");
    }

    #[test]
    fn polymorphic_spec_defaults() {
        let spec = RelationSpec::polymorphic("subject");
        assert_eq!(spec.foreign_key, "subject_id");
        assert_eq!(spec.foreign_type_key.as_deref(), Some("subject_type"));
        assert!(!spec.is_collection());
    }
}
