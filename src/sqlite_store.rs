//! SQLite-backed entitlement store and usage ledger.
//!
//! All statements that mutate counters are single atomic upserts
//! (`INSERT .. ON CONFLICT DO UPDATE SET c = c + excluded.c`), never a read
//! followed by a write in application code, so concurrent requests for the
//! same principal cannot lose updates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;

use crate::entitlement::{
    EntitlementStore, Principal, SubscriptionStatus, Transition, now_millis,
};
use crate::gate::QuotaError;
use crate::identity::PrincipalId;
use crate::ledger::{ActionKind, UsageLedger, UsageRecord, UtcDay};
use crate::policy::Tier;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<SqliteStoreError> for QuotaError {
    fn from(err: SqliteStoreError) -> Self {
        QuotaError::StoreUnavailable(err.to_string())
    }
}

/// One applied entitlement transition, for after-the-fact auditing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntitlementLogRecord {
    pub id: i64,
    pub ts_ms: u64,
    pub customer_ref: String,
    pub tier: Tier,
    pub subscription_status: SubscriptionStatus,
}

/// One principal's usage row, for operator inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageRow {
    pub principal_id: PrincipalId,
    pub record: UsageRecord,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn get_or_create_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Principal, SqliteStoreError> {
        let path = self.path.clone();
        let id = principal_id.as_str().to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<Principal, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR IGNORE INTO principals (principal_id, tier, subscription_status, created_at_ms)
                 VALUES (?1, 'free', 'inactive', ?2)",
                rusqlite::params![id, ts_ms as i64],
            )?;

            let row = tx.query_row(
                "SELECT tier, subscription_status, payment_customer_ref, created_at_ms
                 FROM principals WHERE principal_id = ?1",
                rusqlite::params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )?;
            tx.commit()?;

            let (tier, status, customer_ref, created_at_ms) = row;
            Ok(Principal {
                principal_id: PrincipalId::from(id),
                tier: Tier::parse(&tier),
                subscription_status: SubscriptionStatus::parse(&status),
                payment_customer_ref: customer_ref,
                created_at_ms: i64_to_u64(created_at_ms),
            })
        })
        .await?
    }

    async fn apply_transition_row(
        &self,
        customer_ref: &str,
        tier: Tier,
        status: SubscriptionStatus,
    ) -> Result<Transition, SqliteStoreError> {
        let path = self.path.clone();
        let customer_ref = customer_ref.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<Transition, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let changed = tx.execute(
                "UPDATE principals
                 SET tier = ?2, subscription_status = ?3
                 WHERE payment_customer_ref = ?1",
                rusqlite::params![customer_ref, tier.as_str(), status.as_str()],
            )?;

            if changed == 0 {
                tx.commit()?;
                return Ok(Transition::NoMatch);
            }

            tx.execute(
                "INSERT INTO entitlement_log (ts_ms, customer_ref, tier, subscription_status)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![ts_ms as i64, customer_ref, tier.as_str(), status.as_str()],
            )?;

            tx.commit()?;
            Ok(Transition::Applied)
        })
        .await?
    }

    async fn link_customer_ref_row(
        &self,
        principal_id: &PrincipalId,
        customer_ref: &str,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let id = principal_id.as_str().to_string();
        let customer_ref = customer_ref.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR IGNORE INTO principals (principal_id, tier, subscription_status, created_at_ms)
                 VALUES (?1, 'free', 'inactive', ?2)",
                rusqlite::params![id, ts_ms as i64],
            )?;
            tx.execute(
                "UPDATE principals SET payment_customer_ref = ?2 WHERE principal_id = ?1",
                rusqlite::params![id, customer_ref],
            )?;

            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn get_usage(
        &self,
        principal_id: &PrincipalId,
        day: UtcDay,
    ) -> Result<UsageRecord, SqliteStoreError> {
        let path = self.path.clone();
        let id = principal_id.as_str().to_string();
        let day_key = day.to_string();

        tokio::task::spawn_blocking(move || -> Result<UsageRecord, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let row: Option<(i64, i64, i64)> = conn
                .query_row(
                    "SELECT chat_count, web_search_count, tokens
                     FROM usage_daily WHERE principal_id = ?1 AND day = ?2",
                    rusqlite::params![id, day_key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            Ok(match row {
                Some((chat, web_search, tokens)) => UsageRecord {
                    day,
                    chat: i64_to_u64(chat),
                    web_search: i64_to_u64(web_search),
                    tokens: i64_to_u64(tokens),
                },
                None => UsageRecord::zeroed(day),
            })
        })
        .await?
    }

    async fn increment_usage(
        &self,
        principal_id: &PrincipalId,
        day: UtcDay,
        kind: ActionKind,
        amount: u64,
        tokens: u64,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let id = principal_id.as_str().to_string();
        let day_key = day.to_string();
        let ts_ms = now_millis();
        let (chat, web_search) = match kind {
            ActionKind::Chat => (u64_to_i64(amount), 0),
            ActionKind::WebSearch => (0, u64_to_i64(amount)),
        };
        let tokens_i64 = u64_to_i64(tokens);

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            conn.execute(
                "INSERT INTO usage_daily (principal_id, day, chat_count, web_search_count, tokens, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(principal_id, day) DO UPDATE SET
                     chat_count = chat_count + excluded.chat_count,
                     web_search_count = web_search_count + excluded.web_search_count,
                     tokens = tokens + excluded.tokens,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![id, day_key, chat, web_search, tokens_i64, ts_ms as i64],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_principals(&self) -> Result<Vec<Principal>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Principal>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT principal_id, tier, subscription_status, payment_customer_ref, created_at_ms
                 FROM principals ORDER BY principal_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, tier, status, customer_ref, created_at_ms) = row?;
                out.push(Principal {
                    principal_id: PrincipalId::from(id),
                    tier: Tier::parse(&tier),
                    subscription_status: SubscriptionStatus::parse(&status),
                    payment_customer_ref: customer_ref,
                    created_at_ms: i64_to_u64(created_at_ms),
                });
            }
            Ok(out)
        })
        .await?
    }

    pub async fn list_usage(&self, day: UtcDay) -> Result<Vec<UsageRow>, SqliteStoreError> {
        let path = self.path.clone();
        let day_key = day.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageRow>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT principal_id, chat_count, web_search_count, tokens
                 FROM usage_daily WHERE day = ?1 ORDER BY principal_id",
            )?;
            let rows = stmt.query_map(rusqlite::params![day_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, chat, web_search, tokens) = row?;
                out.push(UsageRow {
                    principal_id: PrincipalId::from(id),
                    record: UsageRecord {
                        day,
                        chat: i64_to_u64(chat),
                        web_search: i64_to_u64(web_search),
                        tokens: i64_to_u64(tokens),
                    },
                });
            }
            Ok(out)
        })
        .await?
    }

    pub async fn list_entitlement_log(
        &self,
        limit: usize,
    ) -> Result<Vec<EntitlementLogRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(
            move || -> Result<Vec<EntitlementLogRecord>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;

                let mut stmt = conn.prepare(
                    "SELECT id, ts_ms, customer_ref, tier, subscription_status
                     FROM entitlement_log ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(rusqlite::params![limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    let (id, ts_ms, customer_ref, tier, status) = row?;
                    out.push(EntitlementLogRecord {
                        id,
                        ts_ms: i64_to_u64(ts_ms),
                        customer_ref,
                        tier: Tier::parse(&tier),
                        subscription_status: SubscriptionStatus::parse(&status),
                    });
                }
                Ok(out)
            },
        )
        .await?
    }
}

#[async_trait]
impl EntitlementStore for SqliteStore {
    async fn get_or_create(&self, principal: &PrincipalId) -> Result<Principal, QuotaError> {
        Ok(self.get_or_create_principal(principal).await?)
    }

    async fn apply_transition(
        &self,
        customer_ref: &str,
        tier: Tier,
        status: SubscriptionStatus,
    ) -> Result<Transition, QuotaError> {
        Ok(self.apply_transition_row(customer_ref, tier, status).await?)
    }

    async fn link_customer_ref(
        &self,
        principal: &PrincipalId,
        customer_ref: &str,
    ) -> Result<(), QuotaError> {
        Ok(self.link_customer_ref_row(principal, customer_ref).await?)
    }
}

#[async_trait]
impl UsageLedger for SqliteStore {
    async fn get_today(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
    ) -> Result<UsageRecord, QuotaError> {
        Ok(self.get_usage(principal, day).await?)
    }

    async fn increment(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
        kind: ActionKind,
        amount: u64,
        tokens: u64,
    ) -> Result<(), QuotaError> {
        Ok(self
            .increment_usage(principal, day, kind, amount, tokens)
            .await?)
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS principals (
            principal_id TEXT PRIMARY KEY NOT NULL,
            tier TEXT NOT NULL DEFAULT 'free',
            subscription_status TEXT NOT NULL DEFAULT 'inactive',
            payment_customer_ref TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_principals_customer_ref
            ON principals(payment_customer_ref);

        CREATE TABLE IF NOT EXISTS usage_daily (
            principal_id TEXT NOT NULL,
            day TEXT NOT NULL,
            chat_count INTEGER NOT NULL DEFAULT 0,
            web_search_count INTEGER NOT NULL DEFAULT 0,
            tokens INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (principal_id, day)
        );

        CREATE TABLE IF NOT EXISTS entitlement_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            customer_ref TEXT NOT NULL,
            tier TEXT NOT NULL,
            subscription_status TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entitlement_log_ts_ms
            ON entitlement_log(ts_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
