//! Restriction evaluation boundary
//!
//! The restriction language and the row-matching engine live outside the
//! synchronization engine. It only needs to know which candidates match.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{IcsError, IcsResult};
use crate::models::SourceKey;

/// Caller-supplied filter expression, opaque to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Restriction(serde_json::Value);

impl Restriction {
    pub fn new(expression: serde_json::Value) -> Self {
        Self(expression)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for Restriction {
    fn from(expression: serde_json::Value) -> Self {
        Self(expression)
    }
}

/// Evaluates restrictions against candidate objects
pub trait RestrictionGate: Send + Sync {
    /// Minimal property set the caller should prefetch before evaluation
    fn required_properties(&self, restriction: &Restriction) -> IcsResult<Vec<String>>;

    /// Source keys among `candidates` that match `restriction`
    ///
    /// Candidates that cannot be resolved to an object are left out of the
    /// result rather than reported as errors.
    fn evaluate(
        &self,
        candidates: &[SourceKey],
        restriction: &Restriction,
        locale: &str,
    ) -> IcsResult<HashSet<SourceKey>>;
}

/// Gate for restrictions already resolved to a list of source keys
///
/// Accepts expressions of the form `{"source_keys": ["<base64>", ...]}`,
/// as produced by callers that evaluate the filter up front.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceKeyListGate;

impl SourceKeyListGate {
    const PROPERTY: &'static str = "source_keys";

    fn allowed(restriction: &Restriction) -> IcsResult<HashSet<SourceKey>> {
        let keys = restriction
            .as_value()
            .get(Self::PROPERTY)
            .cloned()
            .ok_or_else(|| {
                IcsError::InvalidParameter(format!("restriction has no '{}' list", Self::PROPERTY))
            })?;
        serde_json::from_value(keys)
            .map_err(|e| IcsError::InvalidParameter(format!("malformed source key list: {}", e)))
    }
}

impl RestrictionGate for SourceKeyListGate {
    fn required_properties(&self, _restriction: &Restriction) -> IcsResult<Vec<String>> {
        Ok(vec![Self::PROPERTY.to_string()])
    }

    fn evaluate(
        &self,
        candidates: &[SourceKey],
        restriction: &Restriction,
        _locale: &str,
    ) -> IcsResult<HashSet<SourceKey>> {
        let allowed = Self::allowed(restriction)?;
        Ok(candidates
            .iter()
            .filter(|key| allowed.contains(*key))
            .cloned()
            .collect())
    }
}

/// Restriction matching exactly `keys`, for [`SourceKeyListGate`]
pub fn source_key_restriction<'a>(keys: impl IntoIterator<Item = &'a SourceKey>) -> Restriction {
    let keys: Vec<&SourceKey> = keys.into_iter().collect();
    Restriction::new(serde_json::json!({ "source_keys": keys }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SourceKey {
        SourceKey::from(s)
    }

    #[test]
    fn test_source_key_list_gate() {
        let restriction = source_key_restriction([&key("A"), &key("C")]);
        let matched = SourceKeyListGate
            .evaluate(&[key("A"), key("B"), key("C")], &restriction, "")
            .unwrap();
        assert_eq!(matched, HashSet::from([key("A"), key("C")]));
    }

    #[test]
    fn test_unresolved_candidates_are_excluded() {
        let restriction = source_key_restriction([&key("Z")]);
        let matched = SourceKeyListGate
            .evaluate(&[key("A")], &restriction, "en_US")
            .unwrap();
        assert!(matched.is_empty());
    }

    #[test]
    fn test_malformed_restriction() {
        let restriction = Restriction::new(serde_json::json!({ "subject": "hello" }));
        let err = SourceKeyListGate
            .evaluate(&[key("A")], &restriction, "")
            .unwrap_err();
        assert!(matches!(err, IcsError::InvalidParameter(_)));
    }

    #[test]
    fn test_restriction_is_transparent_json() {
        let restriction = Restriction::new(serde_json::json!({ "source_keys": [] }));
        let json = serde_json::to_string(&restriction).unwrap();
        assert_eq!(json, r#"{"source_keys":[]}"#);
    }
}
