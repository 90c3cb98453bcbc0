//! Configuration for resource access
//!
//! KDF costs and revocation behavior are fixed per deployment and passed
//! in explicitly; nothing here reads globals or the environment.

use serde::{Deserialize, Serialize};

use sealbox_crypto::KdfParams;

use crate::error::{AccessError, AccessResult};

/// What removing a member does to the resource key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationPolicy {
    /// Delete the member's wrap and per-member state only.
    ///
    /// The resource key is unchanged, so a removed member who kept a copy
    /// of it can still decrypt any ciphertext they obtain elsewhere.
    #[default]
    AccessMapOnly,
    /// Also rotate the resource key and re-encrypt everything under it.
    RotateKey,
}

/// Resource access configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AccessConfig {
    /// Argon2id cost for new passphrase-sealed values
    pub kdf: KdfParams,
    /// Argon2id cost the legacy passphrase format was written with
    pub legacy_kdf: KdfParams,
    /// Attempts at a conditional update before reporting contention
    pub max_update_attempts: u32,
    /// Behavior of member removal
    pub revocation: RevocationPolicy,
    /// Blob path prefix for encrypted content
    pub content_prefix: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            legacy_kdf: KdfParams::default(),
            max_update_attempts: 8,
            revocation: RevocationPolicy::AccessMapOnly,
            content_prefix: "content".to_string(),
        }
    }
}

impl AccessConfig {
    /// Cheap KDF costs and generous retries for tests
    pub fn testing() -> Self {
        Self {
            kdf: KdfParams::testing(),
            legacy_kdf: KdfParams::testing(),
            max_update_attempts: 64,
            ..Default::default()
        }
    }

    /// Use a different revocation policy
    pub fn with_revocation(mut self, revocation: RevocationPolicy) -> Self {
        self.revocation = revocation;
        self
    }

    /// Check the configuration before use
    pub fn validate(&self) -> AccessResult<()> {
        self.kdf.validate()?;
        self.legacy_kdf.validate()?;
        if self.max_update_attempts == 0 {
            return Err(AccessError::InvalidConfig(
                "max_update_attempts must be at least 1".to_string(),
            ));
        }
        if self.content_prefix.is_empty() || self.content_prefix.contains("..") {
            return Err(AccessError::InvalidConfig(format!(
                "invalid content prefix {:?}",
                self.content_prefix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AccessConfig::default();
        assert_eq!(config.revocation, RevocationPolicy::AccessMapOnly);
        assert!(config.validate().is_ok());
        assert!(AccessConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = AccessConfig {
            max_update_attempts: 0,
            ..AccessConfig::testing()
        };
        assert!(matches!(config.validate(), Err(AccessError::InvalidConfig(_))));

        let config = AccessConfig {
            content_prefix: "../up".into(),
            ..AccessConfig::testing()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_deserializes() {
        let config: AccessConfig =
            serde_json::from_str(r#"{"revocation": "rotate_key", "max_update_attempts": 3}"#).unwrap();
        assert_eq!(config.revocation, RevocationPolicy::RotateKey);
        assert_eq!(config.max_update_attempts, 3);
        assert_eq!(config.kdf, KdfParams::default());
    }
}
