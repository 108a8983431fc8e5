use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// Maximum length of a package name, matching the npm registry limit.
const MAX_NAME_LEN: usize = 214;

/// Errors that can occur when validating a [`PackageIdentity`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// A required field (name or version) is empty.
    #[error("Empty field: {0}")]
    EmptyField(&'static str),

    /// The package name contains characters or structure the registry rejects.
    #[error("Invalid package name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The version string is not a valid semantic version.
    #[error("Invalid version '{version}': {reason}")]
    InvalidVersion {
        /// The rejected version.
        version: String,
        /// Parser error message.
        reason: String,
    },
}

/// A normalized package name (lowercase, optionally `@scope/`-qualified).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    /// Create a new package name, normalizing the input to lowercase.
    ///
    /// No validation is performed; use [`PackageName::validate`] at trust
    /// boundaries.
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_lowercase())
    }

    /// Return the normalized name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the `@scope` part of a scoped name, if any.
    pub fn scope(&self) -> Option<&str> {
        if self.0.starts_with('@') {
            self.0.split_once('/').map(|(scope, _)| scope)
        } else {
            None
        }
    }

    /// Validate the name against the registry naming rules.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::EmptyField`] for an empty name and
    /// [`IdentityError::InvalidName`] when the name is too long, contains
    /// characters outside `[a-z0-9-._~]`, is a path traversal, or has a
    /// malformed `@scope/` prefix.
    pub fn validate(&self) -> Result<(), IdentityError> {
        let name = self.0.as_str();
        let invalid = |reason| {
            Err(IdentityError::InvalidName {
                name: name.to_string(),
                reason,
            })
        };

        if name.is_empty() {
            return Err(IdentityError::EmptyField("name"));
        }
        if name.len() > MAX_NAME_LEN {
            return invalid("longer than 214 characters");
        }

        let bare = if let Some(scoped) = name.strip_prefix('@') {
            let Some((scope, bare)) = scoped.split_once('/') else {
                return invalid("scoped name without '/'");
            };
            if scope.is_empty() || !is_name_segment(scope) {
                return invalid("invalid scope");
            }
            bare
        } else {
            name
        };

        if bare.is_empty() || !is_name_segment(bare) {
            return invalid("only lowercase letters, digits and -._~ are allowed");
        }
        if bare.starts_with('.') || bare.starts_with('_') {
            return invalid("must not start with '.' or '_'");
        }

        Ok(())
    }
}

fn is_name_segment(segment: &str) -> bool {
    segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_' | '~'))
        && segment != "."
        && segment != ".."
}

impl std::fmt::Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Deref for PackageName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PackageName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.to_lowercase()
    }
}

impl PartialEq<&str> for PackageName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.to_lowercase()
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PackageName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PackageName {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl From<PackageName> for String {
    fn from(name: PackageName) -> Self {
        name.0
    }
}

/// A semantic version string.
///
/// Stored as-is; ordering follows semver precedence when both sides parse,
/// with unparseable versions sorting after valid ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (
            semver::Version::parse(&self.0),
            semver::Version::parse(&other.0),
        ) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Version {
    /// Create a new version from the given string (stored as-is, trimmed).
    pub fn new(v: &str) -> Self {
        Self(v.trim().to_string())
    }

    /// Return the version string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the version as semver.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::EmptyField`] for an empty string and
    /// [`IdentityError::InvalidVersion`] if the string is not valid semver.
    pub fn parse(&self) -> Result<semver::Version, IdentityError> {
        if self.0.is_empty() {
            return Err(IdentityError::EmptyField("version"));
        }
        semver::Version::parse(&self.0).map_err(|e| IdentityError::InvalidVersion {
            version: self.0.clone(),
            reason: e.to_string(),
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Deref for Version {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Version {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl PartialEq<str> for Version {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Version {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Uniquely identifies one package artifact: `name@version`.
///
/// Ordering is by name, then by semver precedence of the version, which is
/// the order packages appear in the catalog document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageIdentity {
    /// Package name.
    pub name: PackageName,
    /// Package version.
    pub version: Version,
}

impl PackageIdentity {
    /// Build an identity from raw parts (normalized, not validated).
    pub fn new(name: impl Into<PackageName>, version: impl Into<Version>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Validate both the name and the version.
    ///
    /// # Errors
    ///
    /// Returns the first [`IdentityError`] found.
    pub fn validate(&self) -> Result<(), IdentityError> {
        self.name.validate()?;
        self.version.parse()?;
        Ok(())
    }
}

impl std::fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_normalized() {
        let name = PackageName::new("  Left-Pad ");
        assert_eq!(name.as_str(), "left-pad");
        assert_eq!(name, "LEFT-PAD");
    }

    #[test]
    fn name_validation() {
        assert!(PackageName::new("foo").validate().is_ok());
        assert!(PackageName::new("@aws-cdk/core").validate().is_ok());
        assert_eq!(
            PackageName::new("").validate(),
            Err(IdentityError::EmptyField("name"))
        );
        assert!(PackageName::new("../etc").validate().is_err());
        assert!(PackageName::new("@scope").validate().is_err());
        assert!(PackageName::new("has space").validate().is_err());
        assert!(PackageName::new("a/b").validate().is_err());
        assert!(PackageName::new(".hidden").validate().is_err());
        assert_eq!(PackageName::new("@aws-cdk/core").scope(), Some("@aws-cdk"));
    }

    #[test]
    fn version_ordering_is_semver() {
        let mut versions: Vec<Version> = ["1.10.0", "1.2.0", "1.2.0-beta.1", "0.9.9"]
            .into_iter()
            .map(Version::from)
            .collect();
        versions.sort();
        let ordered: Vec<&str> = versions.iter().map(Version::as_str).collect();
        assert_eq!(ordered, vec!["0.9.9", "1.2.0-beta.1", "1.2.0", "1.10.0"]);
    }

    #[test]
    fn identity_orders_by_name_then_version() {
        let mut ids = vec![
            PackageIdentity::new("foo", "1.10.0"),
            PackageIdentity::new("bar", "2.0.0"),
            PackageIdentity::new("foo", "1.9.0"),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["bar@2.0.0", "foo@1.9.0", "foo@1.10.0"]);
    }

    #[test]
    fn identity_validation_reports_version() {
        let id = PackageIdentity::new("foo", "not-a-version");
        assert!(matches!(
            id.validate(),
            Err(IdentityError::InvalidVersion { .. })
        ));
    }
}
