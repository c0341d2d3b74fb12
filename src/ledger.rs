//! Per-principal, per-UTC-day usage counters.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gate::QuotaError;
use crate::identity::PrincipalId;

/// A metered operation category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Chat,
    WebSearch,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Chat => "chat",
            ActionKind::WebSearch => "web_search",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A calendar day in UTC, the partition key for usage counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtcDay(time::Date);

impl UtcDay {
    pub fn from_epoch_seconds(secs: u64) -> Self {
        let ts = i64::try_from(secs).unwrap_or(i64::MAX);
        let odt = time::OffsetDateTime::from_unix_timestamp(ts)
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
        Self(odt.date())
    }

    pub fn next(self) -> Self {
        Self(self.0.next_day().unwrap_or(self.0))
    }

    pub fn date(self) -> time::Date {
        self.0
    }
}

impl std::fmt::Display for UtcDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}",
            self.0.year(),
            u8::from(self.0.month()),
            self.0.day()
        )
    }
}

impl std::str::FromStr for UtcDay {
    type Err = time::error::Parse;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = time::macros::format_description!("[year]-[month]-[day]");
        Ok(Self(time::Date::parse(s, &format)?))
    }
}

impl Serialize for UtcDay {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UtcDay {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One principal's counters for one UTC day. Counts only ever grow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub day: UtcDay,
    pub chat: u64,
    pub web_search: u64,
    pub tokens: u64,
}

impl UsageRecord {
    pub fn zeroed(day: UtcDay) -> Self {
        Self {
            day,
            chat: 0,
            web_search: 0,
            tokens: 0,
        }
    }

    pub fn count(&self, kind: ActionKind) -> u64 {
        match kind {
            ActionKind::Chat => self.chat,
            ActionKind::WebSearch => self.web_search,
        }
    }

    pub fn add(&mut self, kind: ActionKind, amount: u64, tokens: u64) {
        let slot = match kind {
            ActionKind::Chat => &mut self.chat,
            ActionKind::WebSearch => &mut self.web_search,
        };
        *slot = slot.saturating_add(amount);
        self.tokens = self.tokens.saturating_add(tokens);
    }
}

/// Durable per-day counters. Implementations must make `increment` a single
/// atomic upsert-and-increment so concurrent callers never lose updates.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Returns the record for `(principal, day)`, zeroed if absent.
    async fn get_today(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
    ) -> Result<UsageRecord, QuotaError>;

    async fn increment(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
        kind: ActionKind,
        amount: u64,
        tokens: u64,
    ) -> Result<(), QuotaError>;
}

/// Process-local ledger. Exact within one process, reset on restart; used in
/// tests and as the degradation target when the durable store is down.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<(PrincipalId, UtcDay), UsageRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for MemoryLedger {
    async fn get_today(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
    ) -> Result<UsageRecord, QuotaError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(&(principal.clone(), day))
            .cloned()
            .unwrap_or_else(|| UsageRecord::zeroed(day)))
    }

    async fn increment(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
        kind: ActionKind,
        amount: u64,
        tokens: u64,
    ) -> Result<(), QuotaError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .entry((principal.clone(), day))
            .or_insert_with(|| UsageRecord::zeroed(day))
            .add(kind, amount, tokens);
        Ok(())
    }
}

/// Wraps a durable ledger with a process-local fallback. While the durable
/// store errors, reads and writes land in memory instead of failing the
/// request; quotas become approximate per-process for that window.
pub struct DegradingLedger<L> {
    durable: L,
    fallback: MemoryLedger,
}

impl<L: UsageLedger> DegradingLedger<L> {
    pub fn new(durable: L) -> Self {
        Self {
            durable,
            fallback: MemoryLedger::new(),
        }
    }
}

#[async_trait]
impl<L: UsageLedger> UsageLedger for DegradingLedger<L> {
    async fn get_today(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
    ) -> Result<UsageRecord, QuotaError> {
        match self.durable.get_today(principal, day).await {
            Ok(record) => Ok(record),
            Err(err) => {
                tracing::warn!(principal = %principal, error = %err, "usage ledger read degraded to memory");
                self.fallback.get_today(principal, day).await
            }
        }
    }

    async fn increment(
        &self,
        principal: &PrincipalId,
        day: UtcDay,
        kind: ActionKind,
        amount: u64,
        tokens: u64,
    ) -> Result<(), QuotaError> {
        match self
            .durable
            .increment(principal, day, kind, amount, tokens)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(principal = %principal, action = %kind, error = %err, "usage ledger write degraded to memory");
                self.fallback
                    .increment(principal, day, kind, amount, tokens)
                    .await
            }
        }
    }
}
