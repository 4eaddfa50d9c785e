//! Sieve public API façade (in-process).
//!
//! Request handlers depend on [`Sieve`]: one value per process, built at startup from a
//! schema registry, an optional override table and a limit policy, then shared freely.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use sieve_core::{ParamNode, RecordId, SieveError, SieveResult};
pub use sieve_params::{
    MemoryRecords, NestedRecord, OverrideTable, ParamTreeSanitizer, RecordFactory, RecordFinder, SanitizedNode,
    SanitizedValue,
};
pub use sieve_query::{
    Direction, IncludeEntry, IncludeNode, LimitPolicy, Modifier, Nulls, OrderEntry, OrderSpec, PreloadTree,
};
pub use sieve_schema::{
    habtm_join_name, RelationKind, RelationResolver, RelationSpec, SchemaConfig, SchemaRegistry, TypeSchema,
};

use sieve_query::{includes, limit, orders, preload};

/// Raw read-side query parameters of an index/show request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadParams {
    #[serde(default)]
    pub include: Option<ParamNode>,
    #[serde(default)]
    pub order: Option<ParamNode>,
    #[serde(default)]
    pub limit: Option<ParamNode>,
}

/// Sanitized read-side query, ready for the query builder.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPlan {
    pub includes: IncludeNode,
    pub preloads: PreloadTree,
    pub order: OrderSpec,
    pub limit: Option<u64>,
}

pub struct Sieve<R = ParamNode> {
    registry: Arc<SchemaRegistry>,
    overrides: OverrideTable<R>,
    limits: LimitPolicy,
}

impl<R: Clone> Sieve<R> {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry, overrides: OverrideTable::new(), limits: LimitPolicy::default() }
    }

    pub fn with_overrides(mut self, overrides: OverrideTable<R>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_limits(mut self, limits: LimitPolicy) -> Self {
        self.limits = limits;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry { &self.registry }

    /// Sanitize a write payload for `root_type`. The root never accepts a client `id`;
    /// the record being written is addressed by the route.
    pub fn sanitize_params(
        &self,
        raw: &ParamNode,
        root_type: &str,
        finder: &dyn RecordFinder<Record = R>,
        factory: &dyn RecordFactory<R>,
    ) -> SieveResult<SanitizedNode<R>> {
        ParamTreeSanitizer::new(&self.registry, finder, factory)
            .with_overrides(&self.overrides)
            .sanitize(raw, root_type, false)
    }

    pub fn normalize_includes(&self, raw: &ParamNode) -> IncludeNode { includes::normalize(raw) }

    /// Check a normalized include tree against a raw whitelist.
    pub fn sanitize_includes(&self, tree: &IncludeNode, allowed: &ParamNode) -> SieveResult<IncludeNode> {
        includes::sanitize(tree, &includes::normalize(allowed))
    }

    /// Normalize and check `raw` against the include whitelist registered for `type_name`.
    pub fn includes_for(&self, type_name: &str, raw: &ParamNode) -> SieveResult<IncludeNode> {
        let schema = self.registry.lookup(type_name)?;
        self.sanitize_includes(&includes::normalize(raw), &schema.includes)
    }

    pub fn normalize_order(&self, raw: &ParamNode) -> OrderSpec { orders::normalize(raw) }

    pub fn sanitize_order(&self, spec: &OrderSpec, allowed: &ParamNode, required: &[String]) -> SieveResult<OrderSpec> {
        orders::sanitize(spec, &orders::normalize(allowed), required)
    }

    /// Order for `type_name`: the request's order (or the type's default order when the
    /// request has none), checked against the type's whitelist with required orders appended.
    pub fn orders_for(&self, type_name: &str, raw: Option<&ParamNode>) -> SieveResult<OrderSpec> {
        let schema = self.registry.lookup(type_name)?;
        let requested = match raw {
            Some(v) if !v.is_null() => orders::normalize(v),
            _ => schema.default_order.as_ref().map(orders::normalize).unwrap_or_default(),
        };
        self.sanitize_order(&requested, &schema.orders, &schema.required_orders)
    }

    pub fn sanitize_limit(&self, raw: Option<&ParamNode>) -> SieveResult<Option<u64>> {
        limit::sanitize_limit(raw, &self.limits)
    }

    pub fn preloadables(&self, type_name: &str, tree: &IncludeNode) -> SieveResult<PreloadTree> {
        self.registry.lookup(type_name)?;
        Ok(preload::preloadables(tree, type_name, self.registry.as_ref()))
    }

    /// Sanitize every read-side parameter of a request against `type_name`'s whitelists.
    pub fn plan_read(&self, type_name: &str, params: &ReadParams) -> SieveResult<ReadPlan> {
        let includes = match &params.include {
            Some(raw) => self.includes_for(type_name, raw)?,
            None => IncludeNode::new(),
        };
        let preloads = self.preloadables(type_name, &includes)?;
        let order = self.orders_for(type_name, params.order.as_ref())?;
        let limit = self.sanitize_limit(params.limit.as_ref())?;
        debug!(type_name, includes = includes.len(), order = order.len(), ?limit, "read plan");
        Ok(ReadPlan { includes, preloads, order, limit })
    }
}
