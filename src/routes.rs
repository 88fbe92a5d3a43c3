//! Path-prefix route table
//!
//! Prefixes match on segment boundaries: `/admin` matches `/admin`,
//! `/admin/`, `/admin/x` and `/admin?x`, never `/administrator`.

use crate::config::BackendConfig;
use std::collections::BTreeMap;

/// How the matched prefix is treated before forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteRule {
    /// Drop the prefix; an empty remainder becomes `/`
    StripPrefix,
    /// Forward the path unchanged
    Preserve,
}

/// One prefix → backend mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub path_prefix: String,
    pub target: String,
    pub rewrite: RewriteRule,
}

impl ProxyRoute {
    pub fn new(path_prefix: impl Into<String>, target: impl Into<String>, rewrite: RewriteRule) -> Self {
        let mut path_prefix = path_prefix.into();
        while path_prefix.len() > 1 && path_prefix.ends_with('/') {
            path_prefix.pop();
        }
        Self {
            path_prefix,
            target: target.into(),
            rewrite,
        }
    }

    /// Whether `path` (no query) falls under this route
    pub fn matches(&self, path: &str) -> bool {
        if self.path_prefix == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path and query sent to the backend
    pub fn rewrite_path(&self, path: &str, query: Option<&str>) -> String {
        let path = match self.rewrite {
            RewriteRule::Preserve => path,
            RewriteRule::StripPrefix if self.path_prefix == "/" => path,
            RewriteRule::StripPrefix => path.strip_prefix(self.path_prefix.as_str()).unwrap_or(path),
        };
        let path = if path.is_empty() { "/" } else { path };

        match query {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        }
    }
}

/// Routes ordered longest prefix first
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<ProxyRoute>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<ProxyRoute>) -> Self {
        routes.sort_by(|a, b| {
            b.path_prefix
                .len()
                .cmp(&a.path_prefix.len())
                .then_with(|| a.path_prefix.cmp(&b.path_prefix))
        });
        Self { routes }
    }

    pub fn from_backends(backends: &BTreeMap<String, BackendConfig>) -> Self {
        let routes = backends
            .iter()
            .map(|(name, config)| {
                let rewrite = if config.strip_prefix {
                    RewriteRule::StripPrefix
                } else {
                    RewriteRule::Preserve
                };
                ProxyRoute::new(config.base_path.clone(), name.clone(), rewrite)
            })
            .collect();
        Self::new(routes)
    }

    pub fn match_path(&self, path: &str) -> Option<&ProxyRoute> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
