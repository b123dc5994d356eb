//! Versioned export/import of rule sets.
//!
//! Bundles carry a `major.minor` version tag. Imports from a different major
//! version are rejected instead of being read with the wrong field layout.

use serde::{Deserialize, Serialize};

use super::{Rule, ValidationError};

/// Version tag written into exported bundles.
pub const RULE_BUNDLE_VERSION: &str = "1.0";

/// A set of rules exchanged with configuration tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleBundle {
    /// Version tag of the writer.
    pub version: String,
    /// Rules in the bundle.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleBundle {
    /// Wraps rules in a bundle stamped with the current version.
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            version: RULE_BUNDLE_VERSION.to_string(),
            rules,
        }
    }

    /// Serializes the bundle as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MalformedBundle`] if a rule's metadata cannot be encoded.
    pub fn to_json(&self) -> Result<String, ValidationError> {
        serde_json::to_string_pretty(self).map_err(|e| ValidationError::MalformedBundle {
            reason: e.to_string(),
        })
    }

    /// Decodes a bundle and checks its version.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MalformedBundle`] for undecodable input and
    /// [`ValidationError::UnsupportedBundleVersion`] for a different major version.
    pub fn from_json(raw: &str) -> Result<Self, ValidationError> {
        let bundle: Self =
            serde_json::from_str(raw).map_err(|e| ValidationError::MalformedBundle {
                reason: e.to_string(),
            })?;
        check_bundle_version(&bundle.version, RULE_BUNDLE_VERSION)?;
        Ok(bundle)
    }
}

/// Returns an error unless `found` shares the major version of `supported`.
///
/// # Errors
///
/// Returns [`ValidationError::UnsupportedBundleVersion`] on mismatch.
pub(crate) fn check_bundle_version(found: &str, supported: &str) -> Result<(), ValidationError> {
    let major = |version: &str| version.trim().split('.').next().map(str::to_string);
    match (major(found), major(supported)) {
        (Some(lhs), Some(rhs)) if !lhs.is_empty() && lhs == rhs => Ok(()),
        _ => Err(ValidationError::UnsupportedBundleVersion {
            found: found.to_string(),
            supported: supported.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_bundle_round_trip() {
        let bundle = RuleBundle::new(vec![
            Rule::new("cats", ["danbooru", "gelbooru"]),
            Rule::new("dogs", ["sankaku"]),
        ]);
        let json = bundle.to_json().unwrap();
        let decoded = RuleBundle::from_json(&json).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn test_rule_bundle_accepts_same_major_version() {
        let raw = r#"{"version":"1.7","rules":[{"query":"cats","processor_ids":["A"]}]}"#;
        let bundle = RuleBundle::from_json(raw).unwrap();
        assert_eq!(bundle.rules.len(), 1);
        assert!(bundle.rules[0].metadata().is_empty());
    }

    #[test]
    fn test_rule_bundle_rejects_other_major_version() {
        let raw = r#"{"version":"2.0","rules":[]}"#;
        let err = RuleBundle::from_json(raw).unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedBundleVersion { .. }));
    }

    #[test]
    fn test_rule_bundle_rejects_garbage() {
        let err = RuleBundle::from_json("not json").unwrap_err();
        assert!(matches!(err, ValidationError::MalformedBundle { .. }));
    }

    #[test]
    fn test_check_bundle_version_rejects_empty() {
        assert!(check_bundle_version("", "1.0").is_err());
        assert!(check_bundle_version("1", "1.0").is_ok());
    }
}
