//! Concurrent route table.
//!
//! # Responsibilities
//! - Map `domain/path` keys to handlers, with `/*` wildcard keys
//! - Resolve a request's host through the alias table and default domain
//! - Pick the exact key first, then the closest wildcard prefix
//! - Track which tunnel session owns a route so cleanup never removes a
//!   newer registration
//!
//! # Design Decisions
//! - `DashMap` shards: lookups never see a half-written entry and writers
//!   (tunnel sessions coming and going) only lock one shard
//! - Aliases are swapped whole via `ArcSwap` on config reload

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::{DashMap, DashSet};

use crate::routing::handler::RouteHandler;

/// Identifies the component that registered a route (a tunnel session).
pub type RouteOwner = u64;

#[derive(Debug, Clone)]
struct RouteEntry {
    domain: String,
    path: String,
    handler: RouteHandler,
    owner: Option<RouteOwner>,
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub key: String,
    pub handler: RouteHandler,
    pub short_path: String,
}

#[derive(Debug)]
pub struct RouteTable {
    routes: DashMap<String, RouteEntry>,
    domains: DashSet<String>,
    aliases: ArcSwap<HashMap<String, String>>,
    default_domain: String,
}

fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn route_key(domain: &str, path: &str) -> String {
    format!("{}/{}", domain, normalize_path(path))
}

impl RouteTable {
    pub fn new(default_domain: impl Into<String>) -> Self {
        let default_domain = default_domain.into().to_ascii_lowercase();
        let domains = DashSet::new();
        domains.insert(default_domain.clone());
        Self {
            routes: DashMap::new(),
            domains,
            aliases: ArcSwap::from_pointee(HashMap::new()),
            default_domain,
        }
    }

    pub fn default_domain(&self) -> &str {
        &self.default_domain
    }

    /// Replace the alias table (alias -> canonical domain).
    pub fn set_aliases(&self, aliases: HashMap<String, String>) {
        let normalized = aliases
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_ascii_lowercase()))
            .collect();
        self.aliases.store(Arc::new(normalized));
    }

    pub fn register_domain(&self, domain: &str) -> bool {
        self.domains.insert(domain.to_ascii_lowercase())
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.domains.contains(&domain.to_ascii_lowercase())
    }

    /// Register a route. `None` means the default domain.
    pub fn add(&self, domain: Option<&str>, path: &str, handler: RouteHandler) {
        self.insert(domain, path, handler, None);
    }

    /// Register a route on behalf of `owner`.
    pub fn add_owned(&self, domain: &str, path: &str, handler: RouteHandler, owner: RouteOwner) {
        self.insert(Some(domain), path, handler, Some(owner));
    }

    fn insert(&self, domain: Option<&str>, path: &str, handler: RouteHandler, owner: Option<RouteOwner>) {
        let domain = domain
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| self.default_domain.clone());
        if self.domains.insert(domain.clone()) {
            tracing::debug!(domain = %domain, "Registered new domain");
        }
        let key = route_key(&domain, path);
        tracing::debug!(key = %key, owner = ?owner, "Route added");
        self.routes.insert(
            key,
            RouteEntry {
                domain,
                path: normalize_path(path).to_string(),
                handler,
                owner,
            },
        );
    }

    pub fn remove(&self, domain: Option<&str>, path: &str) -> bool {
        let domain = domain
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| self.default_domain.clone());
        self.routes.remove(&route_key(&domain, path)).is_some()
    }

    /// Remove a route only if `owner` still owns it.
    pub fn remove_if_owned(&self, domain: &str, path: &str, owner: RouteOwner) -> bool {
        let key = route_key(&domain.to_ascii_lowercase(), path);
        self.routes
            .remove_if(&key, |_, entry| entry.owner == Some(owner))
            .is_some()
    }

    /// Every registered `(domain, path)` pair.
    pub fn routes(&self) -> Vec<(String, String)> {
        self.routes
            .iter()
            .map(|e| (e.domain.clone(), e.path.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn canonical_domain(&self, host: &str) -> String {
        let host = host.to_ascii_lowercase();
        let aliases = self.aliases.load();
        let domain = aliases.get(&host).cloned().unwrap_or(host);
        if self.domains.contains(&domain) {
            domain
        } else {
            self.default_domain.clone()
        }
    }

    /// Resolve `host` + decoded `path` to a handler.
    pub fn resolve(&self, host: &str, path: &str) -> Option<ResolvedRoute> {
        let domain = self.canonical_domain(host);
        let path = normalize_path(path);

        let exact = format!("{}/{}", domain, path);
        if let Some(entry) = self.routes.get(&exact) {
            return Some(ResolvedRoute {
                key: exact,
                handler: entry.handler.clone(),
                short_path: String::new(),
            });
        }

        let mut prefix = path;
        loop {
            let key = if prefix.is_empty() {
                format!("{}/*", domain)
            } else {
                format!("{}/{}/*", domain, prefix)
            };
            if let Some(entry) = self.routes.get(&key) {
                let short_path = path[prefix.len()..].trim_start_matches('/').to_string();
                return Some(ResolvedRoute {
                    key,
                    handler: entry.handler.clone(),
                    short_path,
                });
            }
            if prefix.is_empty() {
                return None;
            }
            prefix = match prefix.rfind('/') {
                Some(i) => &prefix[..i],
                None => "",
            };
        }
    }
}
