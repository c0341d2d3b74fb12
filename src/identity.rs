//! Maps inbound requests to stable rate-limit principals.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ledger::UtcDay;

/// Stable identifier for one billable/rate-limited identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PrincipalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PrincipalId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the request-handling layer knows about the caller.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub remote_addr: Option<IpAddr>,
}

impl RequestContext {
    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            remote_addr: None,
        }
    }

    pub fn anonymous(remote_addr: IpAddr) -> Self {
        Self {
            user_id: None,
            remote_addr: Some(remote_addr),
        }
    }
}

/// Sentinel for requests carrying no usable identity signal. Policy treats it
/// as an ordinary free-tier principal, the most restrictive tier.
pub const UNKNOWN_PRINCIPAL: &str = "anon:unknown";

/// Resolves a request to one principal. Authenticated callers get a canonical
/// `user:` id. Anonymous callers get an address bucket keyed by UTC day, so
/// the same address maps to one bucket within a day and a fresh bucket the
/// next day. Never fails.
pub fn resolve(ctx: &RequestContext, day: UtcDay) -> PrincipalId {
    if let Some(user_id) = ctx.user_id.as_deref() {
        let trimmed = user_id.trim();
        if !trimmed.is_empty() {
            return PrincipalId(format!("user:{trimmed}"));
        }
    }

    match ctx.remote_addr {
        Some(addr) => {
            let mut hasher = Sha256::new();
            hasher.update(addr.to_string().as_bytes());
            hasher.update(b"|");
            hasher.update(day.to_string().as_bytes());
            let digest = hasher.finalize();
            let mut hex = String::with_capacity(32);
            for byte in &digest[..16] {
                hex.push_str(&format!("{byte:02x}"));
            }
            PrincipalId(format!("anon:{hex}"))
        }
        None => PrincipalId(UNKNOWN_PRINCIPAL.to_string()),
    }
}
