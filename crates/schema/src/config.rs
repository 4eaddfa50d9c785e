//! Declarative schema configuration (YAML or JSON) turned into a [`SchemaRegistry`].
//!
//! ```yaml
//! types:
//!   property:
//!     attributes: [name, description]
//!     nested: [photos]
//!     includes: { photos: true, landlord: true }
//!     orders: [id, name]
//!     required_orders: [id]
//!     relations:
//!       photos: { kind: has_many, target: photo }
//!       landlord: { kind: belongs_to, target: account }
//! joins:
//!   - between: [account, property]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sieve_core::inflect;
use sieve_core::{ParamNode, SieveResult};
use tracing::warn;

use crate::{RelationKind, RelationSpec, SchemaRegistry, TypeSchema};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaConfig {
    #[serde(default)]
    pub types: BTreeMap<String, TypeConfig>,
    #[serde(default)]
    pub joins: Vec<JoinConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeConfig {
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub nested: Vec<String>,
    #[serde(default)]
    pub includes: ParamNode,
    #[serde(default)]
    pub orders: ParamNode,
    #[serde(default)]
    pub required_orders: Vec<String>,
    #[serde(default)]
    pub default_order: Option<ParamNode>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationConfig {
    pub kind: RelationKind,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub polymorphic: bool,
    #[serde(default)]
    pub foreign_type: Option<String>,
    #[serde(default)]
    pub singular: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinConfig {
    pub between: [String; 2],
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl RelationConfig {
    /// Fill defaults the way the data model names columns: to-one relations own
    /// `<relation>_id`, collections point back through `<owner>_id`.
    fn into_spec(self, owner: &str, name: &str) -> RelationSpec {
        let foreign_key = self.foreign_key.unwrap_or_else(|| {
            if self.kind.is_collection() { format!("{}_id", owner) } else { format!("{}_id", name) }
        });
        let foreign_type_key = if self.polymorphic {
            Some(self.foreign_type.unwrap_or_else(|| format!("{}_type", name)))
        } else {
            None
        };
        RelationSpec {
            name: name.to_string(),
            kind: self.kind,
            target_type: self.target,
            foreign_key,
            foreign_type_key,
            polymorphic: self.polymorphic,
            singular: self.singular.unwrap_or_else(|| inflect::singularize(name)),
        }
    }
}

impl SchemaConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).context("parsing YAML schema config")
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("parsing JSON schema config")
    }

    /// Load a config file; `.json` is parsed as JSON, `.yaml`/`.yml` or no extension as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema config {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("yaml") | Some("yml") | None => Self::from_yaml_str(&raw),
            Some(other) => Err(anyhow!("unsupported schema config extension: {}", other)),
        }
    }

    pub fn into_registry(self) -> SieveResult<SchemaRegistry> {
        let mut builder = SchemaRegistry::builder();
        for (name, cfg) in self.types {
            if cfg.default_order.is_some() && cfg.orders.is_null() && cfg.required_orders.is_empty() {
                warn!(type_name = %name, "default_order set without an order whitelist; it will be rejected");
            }
            let mut schema = TypeSchema::new(&name)
                .attributes(cfg.attributes)
                .nested(cfg.nested)
                .includes(cfg.includes)
                .orders(cfg.orders)
                .required_orders(cfg.required_orders);
            schema.default_order = cfg.default_order;
            builder = builder.register(schema);
            for (rel, rcfg) in cfg.relations {
                let spec = rcfg.into_spec(&name, &rel);
                builder = builder.relation(&name, spec);
            }
        }
        for join in self.joins {
            let [a, b] = join.between;
            builder = builder.habtm_join(&a, &b, join.attributes);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelationResolver;
    use sieve_core::SieveError;

    const YAML: &str = r#"
types:
  property:
    attributes: [name, description]
    nested: [photos, landlord]
    includes: { photos: true, landlord: true }
    orders: [id, name]
    required_orders: [id]
    relations:
      photos: { kind: has_many, target: photo }
      landlord: { kind: belongs_to, target: account }
  photo:
    attributes: [format]
    relations:
      subject: { kind: belongs_to, polymorphic: true }
  account:
    attributes: [name]
joins:
  - between: [property, account]
"#;

    #[test]
    fn yaml_config_builds_registry() {
        let reg = SchemaConfig::from_yaml_str(YAML).unwrap().into_registry().unwrap();
        let property = reg.lookup("property").unwrap();
        assert!(property.permits_attribute("description"));
        assert_eq!(property.nested_relations, vec!["photos".to_string(), "landlord".to_string()]);
        assert_eq!(property.required_orders, vec!["id".to_string()]);

        let photos = reg.resolve("property", "photos").unwrap();
        assert_eq!(photos.foreign_key, "property_id");
        assert_eq!(photos.ids_key(), "photo_ids");
        let landlord = reg.resolve("property", "landlord").unwrap();
        assert_eq!(landlord.foreign_key, "landlord_id");
        let subject = reg.resolve("photo", "subject").unwrap();
        assert!(subject.polymorphic);
        assert_eq!(subject.foreign_type_key.as_deref(), Some("subject_type"));

        assert!(reg.contains("account_property"));
    }

    #[test]
    fn json_config_is_accepted() {
        let cfg = SchemaConfig::from_json_str(r#"{"types": {"tag": {"attributes": ["label"]}}}"#).unwrap();
        let reg = cfg.into_registry().unwrap();
        assert!(reg.lookup("tag").unwrap().permits_attribute("label"));
    }

    #[test]
    fn unknown_target_fails_fast() {
        let cfg = SchemaConfig::from_yaml_str(
            "types:\n  property:\n    relations:\n      landlord: { kind: belongs_to, target: acount }\n",
        )
        .unwrap();
        assert!(matches!(cfg.into_registry(), Err(SieveError::UnknownType(t)) if t == "acount"));
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        assert!(SchemaConfig::from_yaml_str("types:\n  property:\n    atributes: [name]\n").is_err());
    }
}
