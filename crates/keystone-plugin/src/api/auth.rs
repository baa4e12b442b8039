//! Authorization checks for plugin routes that declare permissions.
//!
//! Credential verification is the host's job; an [`Authorizer`] only
//! decides whether an already-identified request carries the required
//! permissions.

use std::collections::HashSet;

use axum::http::{HeaderMap, HeaderName};

/// Decides whether a request may call a route.
pub trait Authorizer: Send + Sync + std::fmt::Debug {
    /// Returns whether the request satisfies every permission in `required`.
    fn authorize(&self, headers: &HeaderMap, required: &[String]) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn authorize(&self, _headers: &HeaderMap, _required: &[String]) -> bool {
        true
    }
}

/// Reads granted permissions from a comma-separated request header.
///
/// Supports the wildcards `*` (everything) and `resource:*`.
#[derive(Debug, Clone)]
pub struct HeaderPermissionAuthorizer {
    header: HeaderName,
}

impl HeaderPermissionAuthorizer {
    /// Default header carrying permissions.
    pub const DEFAULT_HEADER: &'static str = "x-permissions";

    /// Uses the [`Self::DEFAULT_HEADER`] header.
    pub fn new() -> Self {
        Self {
            header: HeaderName::from_static(Self::DEFAULT_HEADER),
        }
    }

    /// Uses a custom header.
    pub fn with_header(header: HeaderName) -> Self {
        Self { header }
    }

    fn granted<'a>(&self, headers: &'a HeaderMap) -> HashSet<&'a str> {
        headers
            .get_all(&self.header)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

impl Default for HeaderPermissionAuthorizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Authorizer for HeaderPermissionAuthorizer {
    fn authorize(&self, headers: &HeaderMap, required: &[String]) -> bool {
        let granted = self.granted(headers);
        if granted.contains("*") {
            return true;
        }
        required.iter().all(|permission| {
            if granted.contains(permission.as_str()) {
                return true;
            }
            permission
                .split_once(':')
                .is_some_and(|(resource, _)| granted.contains(format!("{resource}:*").as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-permissions", HeaderValue::from_str(value).unwrap());
        headers
    }

    fn perms(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_exact_and_wildcards() {
        let auth = HeaderPermissionAuthorizer::new();
        assert!(auth.authorize(&headers("reports:read, billing:write"), &perms(&["reports:read"])));
        assert!(!auth.authorize(&headers("reports:read"), &perms(&["reports:read", "reports:write"])));
        assert!(auth.authorize(&headers("reports:*"), &perms(&["reports:read", "reports:write"])));
        assert!(auth.authorize(&headers("*"), &perms(&["anything:at-all"])));
    }

    #[test]
    fn test_missing_header_denies() {
        let auth = HeaderPermissionAuthorizer::new();
        assert!(!auth.authorize(&HeaderMap::new(), &perms(&["reports:read"])));
        assert!(auth.authorize(&HeaderMap::new(), &[]));
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAllAuthorizer.authorize(&HeaderMap::new(), &perms(&["x:y"])));
    }
}
