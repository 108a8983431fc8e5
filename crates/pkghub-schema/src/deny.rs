use serde::{Deserialize, Serialize};

use crate::types::{PackageIdentity, PackageName};

/// Version value that matches every version of a package.
pub const WILDCARD_VERSION: &str = "*";

/// An exclusion rule removing one or more package identities from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    /// Name of the denied package.
    #[serde(alias = "name")]
    pub package: PackageName,

    /// Exact version to deny. `None` or `"*"` denies every version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Operator-facing reason, surfaced in rejections and audits.
    pub reason: String,
}

impl DenyRule {
    /// A rule denying every version of `package`.
    pub fn all_versions(package: impl Into<PackageName>, reason: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: None,
            reason: reason.into(),
        }
    }

    /// A rule denying exactly `package@version`.
    pub fn exact(
        package: impl Into<PackageName>,
        version: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            version: Some(version.into()),
            reason: reason.into(),
        }
    }

    /// Whether this rule applies to every version of its package.
    pub fn is_wildcard(&self) -> bool {
        self.version
            .as_deref()
            .is_none_or(|v| v.trim() == WILDCARD_VERSION)
    }

    /// Whether this is an exact-version rule matching `identity`.
    pub fn matches_exact(&self, identity: &PackageIdentity) -> bool {
        !self.is_wildcard()
            && self.package == identity.name
            && self
                .version
                .as_deref()
                .is_some_and(|v| v.trim() == identity.version.as_str())
    }

    /// Whether this is a wildcard rule matching `identity`'s name.
    pub fn matches_name(&self, identity: &PackageIdentity) -> bool {
        self.is_wildcard() && self.package == identity.name
    }

    /// Whether this rule matches `identity` at all.
    pub fn matches(&self, identity: &PackageIdentity) -> bool {
        self.matches_exact(identity) || self.matches_name(identity)
    }
}

impl std::fmt::Display for DenyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) if !self.is_wildcard() => write!(f, "{}@{v}", self.package),
            _ => write!(f, "{}@{WILDCARD_VERSION}", self.package),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_forms() {
        assert!(DenyRule::all_versions("foo", "r").is_wildcard());
        assert!(DenyRule::exact("foo", "*", "r").is_wildcard());
        assert!(!DenyRule::exact("foo", "1.0.0", "r").is_wildcard());
    }

    #[test]
    fn matching() {
        let id = PackageIdentity::new("foo", "1.0.0");
        assert!(DenyRule::exact("foo", "1.0.0", "r").matches_exact(&id));
        assert!(!DenyRule::exact("foo", "2.0.0", "r").matches(&id));
        assert!(DenyRule::all_versions("FOO", "r").matches_name(&id));
        assert!(!DenyRule::all_versions("bar", "r").matches(&id));
    }

    #[test]
    fn deserializes_name_alias() {
        let rule: DenyRule =
            serde_json::from_str(r#"{"name":"foo","version":"*","reason":"spam"}"#).unwrap();
        assert_eq!(rule.package.as_str(), "foo");
        assert_eq!(rule.to_string(), "foo@*");
    }
}
