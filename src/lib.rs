//! Daily-quota and entitlement admission control for metered chat relays.
//!
//! The crate decides, for a given caller identity, whether a request is
//! allowed today, records usage after the caller's downstream call succeeds,
//! and applies payment-provider lifecycle events to the caller's tier. The
//! HTTP surface, signature verification, and the downstream LLM/search calls
//! all belong to the embedding service.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollgate::{
//!     ActionKind, Decision, MemoryEntitlements, MemoryLedger, PolicyTable, QuotaGate,
//!     RequestContext,
//! };
//!
//! # async fn example() -> Result<(), tollgate::QuotaError> {
//! let gate = QuotaGate::new(
//!     Arc::new(MemoryEntitlements::new()),
//!     Arc::new(MemoryLedger::new()),
//!     PolicyTable::default(),
//! );
//!
//! let ctx = RequestContext::authenticated("42");
//! match gate.check(&ctx, ActionKind::Chat, 280).await? {
//!     Decision::Admitted => {
//!         // ... perform the downstream call, then on success:
//!         gate.record_usage(&ctx, ActionKind::Chat, 512).await;
//!     }
//!     Decision::Rejected(rejection) => {
//!         // surface {reason, limit, tier} to the caller
//!         let _ = rejection;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entitlement;
pub mod gate;
pub mod identity;
pub mod ledger;
pub mod observability;
pub mod policy;
pub mod updater;

#[cfg(feature = "store-redis")]
pub mod redis_store;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

pub use config::{ConfigError, StoreConfig, TollgateConfig};
pub use entitlement::{
    EntitlementStore, MemoryEntitlements, Principal, SubscriptionStatus, Transition,
};
pub use gate::{Clock, Decision, QuotaError, QuotaGate, RejectReason, Rejection, SystemClock};
pub use identity::{PrincipalId, RequestContext, UNKNOWN_PRINCIPAL};
pub use ledger::{ActionKind, DegradingLedger, MemoryLedger, UsageLedger, UsageRecord, UtcDay};
pub use observability::{Observability, ObservabilitySnapshot};
pub use policy::{PolicyLimits, PolicyTable, Tier};
pub use updater::{EntitlementUpdater, WebhookEvent};

#[cfg(feature = "store-redis")]
pub use redis_store::{RedisStore, RedisStoreError};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{EntitlementLogRecord, SqliteStore, SqliteStoreError, UsageRow};
