//! Caller identity → rate-limit key.

use std::net::IpAddr;

use sha2::{Digest, Sha256};

/// What is known about a caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIdentity<'a> {
    /// Authenticated principal id
    pub user_id: Option<&'a str>,
    /// Raw service credential; only its digest is kept
    pub api_key: Option<&'a str>,
    /// Raw `X-Forwarded-For` header value
    pub forwarded_for: Option<&'a str>,
    pub peer: Option<IpAddr>,
}

/// Key a caller's requests are counted under.
///
/// Precedence: authenticated user, then API key, then the first
/// `X-Forwarded-For` hop, then the peer address, then `anonymous`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn user(id: &str) -> Self {
        Self(format!("user:{id}"))
    }

    pub fn api_key(raw: &str) -> Self {
        Self(format!("apikey:{:x}", Sha256::digest(raw.as_bytes())))
    }

    pub fn ip(addr: &str) -> Self {
        Self(format!("ip:{addr}"))
    }

    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    pub fn derive(identity: &ClientIdentity<'_>) -> Self {
        if let Some(id) = non_empty(identity.user_id) {
            return Self::user(id);
        }
        if let Some(key) = non_empty(identity.api_key) {
            return Self::api_key(key);
        }
        if let Some(hop) = identity
            .forwarded_for
            .and_then(|v| v.split(',').next())
            .and_then(|hop| non_empty(Some(hop)))
        {
            return Self::ip(hop);
        }
        match identity.peer {
            Some(addr) => Self::ip(&addr.to_string()),
            None => Self::anonymous(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Counter name for this caller under one policy scope.
    pub fn scoped(&self, scope: &str) -> String {
        format!("{}:{scope}", self.0)
    }
}

impl core::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
