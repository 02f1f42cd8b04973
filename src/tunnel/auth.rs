//! Tunnel key registry.
//!
//! Each accepted pre-shared key may be scoped to a list of domains. The key
//! set is swapped whole on config reload; sessions keep the scope they
//! authenticated with.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::TunnelKeyConfig;

/// Domains an authenticated session may register routes for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Unrestricted,
    Domains(Vec<String>),
}

impl Scope {
    /// Exact match or a subdomain of an allowed domain.
    pub fn allows(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        match self {
            Scope::Unrestricted => true,
            Scope::Domains(allowed) => allowed.iter().any(|d| {
                domain == *d
                    || domain
                        .strip_suffix(d.as_str())
                        .map(|rest| rest.ends_with('.'))
                        .unwrap_or(false)
            }),
        }
    }
}

#[derive(Debug)]
struct AcceptedKey {
    secret: Vec<u8>,
    scope: Scope,
}

#[derive(Debug)]
pub struct KeyRegistry {
    keys: ArcSwap<Vec<AcceptedKey>>,
}

impl KeyRegistry {
    pub fn new(keys: &[TunnelKeyConfig]) -> Self {
        Self {
            keys: ArcSwap::from_pointee(Self::build(keys)),
        }
    }

    fn build(keys: &[TunnelKeyConfig]) -> Vec<AcceptedKey> {
        keys.iter()
            .map(|k| AcceptedKey {
                secret: k.secret.as_bytes().to_vec(),
                scope: if k.domains.is_empty() {
                    Scope::Unrestricted
                } else {
                    Scope::Domains(k.domains.iter().map(|d| d.to_ascii_lowercase()).collect())
                },
            })
            .collect()
    }

    /// Swap in a new key set.
    pub fn replace(&self, keys: &[TunnelKeyConfig]) {
        self.keys.store(Arc::new(Self::build(keys)));
        tracing::info!(keys = keys.len(), "Tunnel keys reloaded");
    }

    pub fn authenticate(&self, secret: &str) -> Option<Scope> {
        let keys = self.keys.load();
        keys.iter()
            .find(|k| constant_time_eq(&k.secret, secret.as_bytes()))
            .map(|k| k.scope.clone())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
