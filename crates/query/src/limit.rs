//! Page-size policy for index requests.

use metrics::counter;
use serde::{Deserialize, Serialize};
use sieve_core::{ParamNode, SieveError, SieveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitPolicy {
    /// Largest page a caller may request; `None` lifts the cap and the requirement.
    pub resource_limit: Option<u64>,
    /// Used when the request names no limit. Should not exceed `resource_limit`.
    pub default_limit: Option<u64>,
}

impl Default for LimitPolicy {
    fn default() -> Self { Self { resource_limit: Some(1000), default_limit: None } }
}

/// Resolve the effective limit for a request.
///
/// With a resource limit in force a limit must come from the request or the default,
/// and may not exceed the cap. Non-numeric or negative values are rejected.
pub fn sanitize_limit(requested: Option<&ParamNode>, policy: &LimitPolicy) -> SieveResult<Option<u64>> {
    let requested = match requested {
        None | Some(ParamNode::Null) => None,
        Some(v) => Some(parse_limit(v).ok_or_else(reject)?),
    };
    let Some(cap) = policy.resource_limit else { return Ok(requested) };
    match requested.or(policy.default_limit) {
        None => Err(SieveError::ParameterMissing("limit".to_string())),
        Some(limit) if limit > cap => Err(reject()),
        Some(limit) => Ok(Some(limit)),
    }
}

fn parse_limit(v: &ParamNode) -> Option<u64> {
    match v {
        ParamNode::Number(n) => n.as_u64(),
        ParamNode::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn reject() -> SieveError {
    counter!("sieve_unpermitted_total", 1u64, "kind" => "limit");
    SieveError::UnpermittedParameters(vec!["limit".to_string()])
}
