//! Dialback secret lookup.
//!
//! The secret is shared between the Originating Server and the Authoritative
//! Server for a domain (often the same machine). It is resolved per
//! `(local, remote)` pair so deployments can rotate or split secrets by peer.

use std::collections::HashMap;

use crate::types::ServerIdentity;

/// Resolves the dialback secret a hosted domain uses towards a peer.
pub trait SecretResolver: Send + Sync {
    /// `local` is the hosted (originating/authoritative) domain, `remote`
    /// the receiving peer. `None` means dialback is not possible.
    fn secret_for(&self, local: &ServerIdentity, remote: &ServerIdentity) -> Option<String>;
}

/// In-memory secret table keyed by hosted domain.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    default_secret: Option<String>,
    by_domain: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `secret` for every hosted domain without an explicit entry.
    pub fn with_default(secret: impl Into<String>) -> Self {
        Self { default_secret: Some(secret.into()), by_domain: HashMap::new() }
    }

    /// Set the secret for one hosted domain.
    pub fn insert(&mut self, domain: &ServerIdentity, secret: impl Into<String>) {
        self.by_domain.insert(domain.normalized(), secret.into());
    }
}

impl SecretResolver for StaticSecrets {
    fn secret_for(&self, local: &ServerIdentity, _remote: &ServerIdentity) -> Option<String> {
        self.by_domain
            .get(&local.normalized())
            .or(self.default_secret.as_ref())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_domain_entry_wins_over_default() {
        let mut secrets = StaticSecrets::with_default("fallback");
        secrets.insert(&"A.Example".into(), "s3cr3t");

        let peer = ServerIdentity::new("b.example");
        assert_eq!(secrets.secret_for(&"a.example".into(), &peer).as_deref(), Some("s3cr3t"));
        assert_eq!(secrets.secret_for(&"c.example".into(), &peer).as_deref(), Some("fallback"));
    }

    #[test]
    fn empty_table_has_no_secret() {
        let secrets = StaticSecrets::new();
        assert!(secrets.secret_for(&"a.example".into(), &"b.example".into()).is_none());
    }
}
