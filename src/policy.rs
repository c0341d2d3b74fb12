//! Tier-to-limits mapping. Pure configuration, total over every tier value
//! the entitlement store can produce.

use serde::{Deserialize, Serialize};

use crate::entitlement::SubscriptionStatus;
use crate::ledger::ActionKind;

/// Entitlement level of a principal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Premium,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }

    /// Parses a stored tier string. Unrecognized or corrupt values resolve to
    /// `Free`, never to anything more permissive.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "premium" => Tier::Premium,
            _ => Tier::Free,
        }
    }

    /// The tier a subscription status entitles the principal to.
    pub fn for_status(status: SubscriptionStatus) -> Self {
        if status.is_entitled() {
            Tier::Premium
        } else {
            Tier::Free
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric limits for one tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLimits {
    pub chat_per_day: u64,
    pub web_search_per_day: u64,
    pub max_request_chars: usize,
}

impl PolicyLimits {
    pub fn free_defaults() -> Self {
        Self {
            chat_per_day: 5,
            web_search_per_day: 3,
            max_request_chars: 2_000,
        }
    }

    pub fn premium_defaults() -> Self {
        Self {
            chat_per_day: 200,
            web_search_per_day: 100,
            max_request_chars: 8_000,
        }
    }

    pub fn max_actions(&self, kind: ActionKind) -> u64 {
        match kind {
            ActionKind::Chat => self.chat_per_day,
            ActionKind::WebSearch => self.web_search_per_day,
        }
    }
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self::free_defaults()
    }
}

/// The policy rows for every tier. Seeded with conservative hardcoded
/// defaults so `resolve` is always total and never falls open to unlimited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default = "PolicyLimits::free_defaults")]
    pub free: PolicyLimits,
    #[serde(default = "PolicyLimits::premium_defaults")]
    pub premium: PolicyLimits,
}

impl PolicyTable {
    pub fn resolve(&self, tier: Tier) -> &PolicyLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            free: PolicyLimits::free_defaults(),
            premium: PolicyLimits::premium_defaults(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_total_and_never_unlimited() {
        let table = PolicyTable::default();
        for tier in [Tier::Free, Tier::Premium] {
            let limits = table.resolve(tier);
            assert!(limits.chat_per_day < u64::MAX);
            assert!(limits.web_search_per_day < u64::MAX);
            assert!(limits.max_request_chars < usize::MAX);
        }
    }

    #[test]
    fn corrupt_tier_strings_resolve_to_free_limits() {
        let table = PolicyTable::default();
        let tier = Tier::parse("enterprise??");
        assert_eq!(tier, Tier::Free);
        assert_eq!(table.resolve(tier), &PolicyLimits::free_defaults());
    }

    #[test]
    fn free_defaults_match_the_seeded_daily_chat_limit() {
        assert_eq!(PolicyLimits::free_defaults().chat_per_day, 5);
    }

    #[test]
    fn premium_limits_exceed_free_limits() {
        let table = PolicyTable::default();
        assert!(table.premium.chat_per_day > table.free.chat_per_day);
        assert!(table.premium.max_request_chars > table.free.max_request_chars);
    }
}
