//! Redis-backed entitlement store and usage ledger.
//!
//! Usage counters live in per-(principal, day) hashes mutated with `HINCRBY`,
//! which is atomic on the server, so concurrent increments never lose
//! updates. Day hashes carry a TTL so stale buckets expire on their own.
//!
//! Principal records are JSON values. `apply_transition` is a read-mutate-set
//! on the principal record; the entitlement row has a single logical writer
//! per customer ref (the updater), so no server-side script is needed there.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use crate::entitlement::{
    EntitlementStore, Principal, SubscriptionStatus, Transition, now_millis,
};
use crate::gate::QuotaError;
use crate::identity::PrincipalId;
use crate::ledger::{ActionKind, UsageLedger, UsageRecord, UtcDay};
use crate::policy::Tier;

const USAGE_TTL_SECS: i64 = 3 * 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<RedisStoreError> for QuotaError {
    fn from(err: RedisStoreError) -> Self {
        QuotaError::StoreUnavailable(err.to_string())
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "tollgate".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_principal(&self, principal: &PrincipalId) -> String {
        format!("{}:principal:{}", self.prefix, principal)
    }

    fn key_customer(&self, customer_ref: &str) -> String {
        format!("{}:customer:{customer_ref}", self.prefix)
    }

    fn key_usage(&self, principal: &PrincipalId, day: UtcDay) -> String {
        format!("{}:usage:{principal}:{day}", self.prefix)
    }

    async fn load_principal(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        principal: &PrincipalId,
    ) -> Result<Option<Principal>, RedisStoreError> {
        let raw: Option<String> = conn.get(self.key_principal(principal)).await?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn store_principal(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        record: &Principal,
    ) -> Result<(), RedisStoreError> {
        let raw = serde_json::to_string(record)?;
        let _: () = conn.set(self.key_principal(&record.principal_id), raw).await?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for RedisStore {
    async fn get_or_create(&self, principal: &PrincipalId) -> Result<Principal, QuotaError> {
        let mut conn = self.connection().await.map_err(RedisStoreError::from)?;

        let fresh = Principal::new_free(principal.clone(), now_millis());
        let raw = serde_json::to_string(&fresh).map_err(RedisStoreError::from)?;
        // SET NX keeps concurrent first-access idempotent: only one caller's
        // default row wins, everyone reads the same record afterwards.
        let _: bool = conn
            .set_nx(self.key_principal(principal), raw)
            .await
            .map_err(RedisStoreError::from)?;

        let record = self
            .load_principal(&mut conn, principal)
            .await?
            .unwrap_or(fresh);
        Ok(record)
    }

    async fn apply_transition(
        &self,
        customer_ref: &str,
        tier: Tier,
        status: SubscriptionStatus,
    ) -> Result<Transition, QuotaError> {
        let mut conn = self.connection().await.map_err(RedisStoreError::from)?;

        let principal_id: Option<String> = conn
            .get(self.key_customer(customer_ref))
            .await
            .map_err(RedisStoreError::from)?;
        let Some(principal_id) = principal_id else {
            return Ok(Transition::NoMatch);
        };

        let principal_id = PrincipalId::from(principal_id);
        let Some(mut record) = self.load_principal(&mut conn, &principal_id).await? else {
            return Ok(Transition::NoMatch);
        };

        record.tier = tier;
        record.subscription_status = status;
        self.store_principal(&mut conn, &record).await?;
        Ok(Transition::Applied)
    }

    async fn link_customer_ref(
        &self,
        principal: &PrincipalId,
        customer_ref: &str,
    ) -> Result<(), QuotaError> {
        let mut conn = self.connection().await.map_err(RedisStoreError::from)?;

        let mut record = self
            .load_principal(&mut conn, principal)
            .await?
            .unwrap_or_else(|| Principal::new_free(principal.clone(), now_millis()));
        record.payment_customer_ref = Some(customer_ref.to_string());
        self.store_principal(&mut conn, &record).await?;

        let _: () = conn
            .set(self.key_customer(customer_ref), principal.as_str())
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }
}

#[async_trait]
impl UsageLedger for RedisStore {
    async fn get_today(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
    ) -> Result<UsageRecord, QuotaError> {
        let mut conn = self.connection().await.map_err(RedisStoreError::from)?;

        let fields: HashMap<String, u64> = conn
            .hgetall(self.key_usage(principal, day))
            .await
            .map_err(RedisStoreError::from)?;

        Ok(UsageRecord {
            day,
            chat: fields.get("chat").copied().unwrap_or(0),
            web_search: fields.get("web_search").copied().unwrap_or(0),
            tokens: fields.get("tokens").copied().unwrap_or(0),
        })
    }

    async fn increment(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
        kind: ActionKind,
        amount: u64,
        tokens: u64,
    ) -> Result<(), QuotaError> {
        let mut conn = self.connection().await.map_err(RedisStoreError::from)?;
        let key = self.key_usage(principal, day);

        let _: () = redis::pipe()
            .atomic()
            .hincr(&key, kind.as_str(), amount as i64)
            .ignore()
            .hincr(&key, "tokens", tokens as i64)
            .ignore()
            .expire(&key, USAGE_TTL_SECS)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }
}
