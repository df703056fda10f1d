//! Dialback configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > dialback.toml > defaults
//!
//! ```toml
//! verify_timeout_secs = 60
//! default_secret = "s3cr3t"
//!
//! [secrets]
//! "a.example" = "per-domain-secret"
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::{error::DialbackResult, secrets::StaticSecrets, types::ServerIdentity};

/// Verify requests wait this long for the Authoritative Server by default.
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Deserialize, Clone)]
pub struct DialbackConfig {
    /// How long a verify request may stay unanswered.
    pub verify_timeout_secs: u64,
    /// Secret used for every hosted domain without an entry in `secrets`.
    #[serde(default)]
    pub default_secret: Option<String>,
    /// Per hosted domain secrets.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

impl DialbackConfig {
    /// Load from `dialback.toml` (optional) and `DIALBACK__*` env vars.
    pub fn load() -> DialbackResult<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        let cfg = config::Config::builder()
            .set_default("verify_timeout_secs", DEFAULT_VERIFY_TIMEOUT_SECS)?
            .add_source(config::File::with_name("dialback").required(false))
            // DIALBACK__VERIFY_TIMEOUT_SECS, DIALBACK__DEFAULT_SECRET, ...
            .add_source(
                config::Environment::with_prefix("DIALBACK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Parse a TOML document, filling unset fields with defaults.
    pub fn from_toml(source: &str) -> DialbackResult<Self> {
        let cfg = config::Config::builder()
            .set_default("verify_timeout_secs", DEFAULT_VERIFY_TIMEOUT_SECS)?
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Build the secret table described by this config.
    pub fn secret_table(&self) -> StaticSecrets {
        let mut table = match &self.default_secret {
            Some(secret) => StaticSecrets::with_default(secret.clone()),
            None => StaticSecrets::new(),
        };
        for (domain, secret) in &self.secrets {
            table.insert(&ServerIdentity::new(domain.as_str()), secret.clone());
        }
        table
    }
}

impl Default for DialbackConfig {
    fn default() -> Self {
        Self {
            verify_timeout_secs: DEFAULT_VERIFY_TIMEOUT_SECS,
            default_secret: None,
            secrets: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretResolver;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = DialbackConfig::from_toml("").unwrap();
        assert_eq!(cfg.verify_timeout(), Duration::from_secs(60));
        assert!(cfg.default_secret.is_none());
        assert!(cfg.secrets.is_empty());
    }

    #[test]
    fn parses_secrets_table() {
        let cfg = DialbackConfig::from_toml(
            r#"
            verify_timeout_secs = 15
            default_secret = "fallback"

            [secrets]
            "a.example" = "s3cr3t"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.verify_timeout(), Duration::from_secs(15));
        let table = cfg.secret_table();
        let peer = ServerIdentity::new("b.example");
        assert_eq!(table.secret_for(&"a.example".into(), &peer).as_deref(), Some("s3cr3t"));
        assert_eq!(table.secret_for(&"z.example".into(), &peer).as_deref(), Some("fallback"));
    }

    #[test]
    fn rejects_non_numeric_timeout() {
        assert!(DialbackConfig::from_toml(r#"verify_timeout_secs = "soon""#).is_err());
    }
}
