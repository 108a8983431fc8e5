use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// Errors produced when parsing a [`Sha256Digest`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The hex portion is not exactly 64 characters long.
    #[error("Invalid SHA256 digest: expected 64 hex characters, got {len} in '{input}'")]
    InvalidLength {
        /// Number of characters found after stripping the prefix.
        len: usize,
        /// The offending input.
        input: String,
    },

    /// The hex portion contains characters outside `[0-9a-fA-F]`.
    #[error("Invalid SHA256 digest: contains non-hex characters in '{0}'")]
    NonHex(String),
}

/// A validated SHA256 digest (64 lowercase hex characters).
///
/// This newtype ensures that every integrity digest in the pipeline is
/// validated at deserialization time, so a malformed hex string can never
/// reach the comparison in the validating stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Parse a digest, accepting strings with or without a `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError`] if the hex portion is not exactly 64 ASCII hex
    /// characters.
    pub fn new(s: impl Into<String>) -> Result<Self, DigestError> {
        let s = s.into();
        let hex = s.strip_prefix("sha256:").unwrap_or(&s);

        if hex.len() != 64 {
            return Err(DigestError::InvalidLength {
                len: hex.len(),
                input: s.clone(),
            });
        }

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::NonHex(s.clone()));
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Compute the SHA256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Get the digest as a string slice (bare hex, no prefix).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render the digest in prefixed form (`sha256:<hex>`).
    pub fn prefixed(&self) -> String {
        format!("sha256:{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Sha256Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_known_vector() {
        let digest = Sha256Digest::compute(b"hello world");
        assert_eq!(
            digest.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn accepts_prefix_and_normalizes_case() {
        let upper = "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9";
        let digest = Sha256Digest::new(format!("sha256:{upper}")).unwrap();
        assert_eq!(digest, Sha256Digest::compute(b"hello world"));
        assert!(digest.prefixed().starts_with("sha256:b94d"));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            Sha256Digest::new("abc"),
            Err(DigestError::InvalidLength { len: 3, .. })
        ));
        let not_hex = "z".repeat(64);
        assert!(matches!(
            Sha256Digest::new(not_hex),
            Err(DigestError::NonHex(_))
        ));
    }

    #[test]
    fn deserialize_validates() {
        let bad: Result<Sha256Digest, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
