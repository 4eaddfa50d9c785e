//! Sieve core types and errors shared by the sanitizers.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod inflect;

/// One level of untrusted client input: scalar, map, list or explicit null.
///
/// Maps keep insertion order (`serde_json/preserve_order`), which order specs rely on
/// for precedence.
pub type ParamNode = serde_json::Value;

/// Mapping level of a [`ParamNode`].
pub type ParamMap = serde_json::Map<String, ParamNode>;

/// Boxed error raised by host collaborators (record finders, factories, overrides).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Primary key of a persisted record as supplied by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Str(String),
}

impl RecordId {
    /// Extract an id from an `id` scalar. Numeric strings are read as integers so that
    /// `"5"` and `5` address the same record; null, empty and non-scalar values are no id.
    pub fn from_param(v: &ParamNode) -> Option<Self> {
        match v {
            ParamNode::Number(n) => n.as_i64().map(Self::Int),
            ParamNode::String(s) if s.is_empty() => None,
            ParamNode::String(s) => Some(match s.parse::<i64>() {
                Ok(n) => Self::Int(n),
                Err(_) => Self::Str(s.clone()),
            }),
            _ => None,
        }
    }

    pub fn to_param(&self) -> ParamNode {
        match self {
            Self::Int(n) => ParamNode::from(*n),
            Self::Str(s) => ParamNode::String(s.clone()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Errors raised by the sanitizers.
#[derive(Debug, thiserror::Error)]
pub enum SieveError {
    /// Requested include/order/limit keys that the whitelist does not permit.
    #[error("unpermitted parameters: {}", .0.join(", "))]
    UnpermittedParameters(Vec<String>),
    #[error("parameter missing: {0}")]
    ParameterMissing(String),
    /// No schema registered under this type name (configuration error).
    #[error("unknown type: {0}")]
    UnknownType(String),
    /// A type declares a nested relation the resolver cannot resolve (configuration error).
    #[error("unknown relation `{relation}` on type `{type_name}`")]
    UnknownRelation { type_name: String, relation: String },
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    /// Failure reported by a host collaborator, passed through untouched.
    #[error(transparent)]
    Collaborator(BoxError),
}

impl SieveError {
    pub fn collaborator<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Collaborator(err.into())
    }

    /// Offending keys when this is an `UnpermittedParameters` rejection.
    pub fn unpermitted(&self) -> Option<&[String]> {
        match self {
            Self::UnpermittedParameters(keys) => Some(keys),
            _ => None,
        }
    }
}

pub type SieveResult<T> = Result<T, SieveError>;

pub mod prelude {
    pub use super::{BoxError, ParamMap, ParamNode, RecordId, SieveError, SieveResult};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_id_from_param() {
        assert_eq!(RecordId::from_param(&json!(5)), Some(RecordId::Int(5)));
        assert_eq!(RecordId::from_param(&json!("5")), Some(RecordId::Int(5)));
        assert_eq!(RecordId::from_param(&json!("abc")), Some(RecordId::Str("abc".into())));
        assert_eq!(RecordId::from_param(&json!("")), None);
        assert_eq!(RecordId::from_param(&json!(null)), None);
        assert_eq!(RecordId::from_param(&json!({"id": 1})), None);
        assert_eq!(RecordId::Int(7).to_param(), json!(7));
    }

    #[test]
    fn unpermitted_message_lists_keys() {
        let err = SieveError::UnpermittedParameters(vec!["y".into(), "x.z".into()]);
        assert_eq!(err.to_string(), "unpermitted parameters: y, x.z");
        assert_eq!(err.unpermitted(), Some(&["y".to_string(), "x.z".to_string()][..]));
    }
}
