//! SQLite store.
//!
//! Every call opens its own connection inside `spawn_blocking`. Writes that
//! read before they write use `BEGIN IMMEDIATE`, which takes the database
//! write lock up front: two debits racing for the same balance are
//! serialized by SQLite itself, and the loser waits on `busy_timeout`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use tracing::warn;

use crate::error::StoreError;
use crate::ledger::types::settle;
use crate::ledger::{
    CreditBalance, CreditKind, LedgerEntry, LedgerMutation, LedgerStore, MutationOutcome, TenantId,
};
use crate::webhook::dedup::{EventStore, NewWebhookEvent, RecordOutcome, StoredEvent};
use crate::webhook::events::ObjectRef;
use crate::webhook::records::{
    transition_record, AuditContext, AuditEntry, NewRecord, RecordStore, TrackedRecord,
    Transition, TransitionOutcome,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create tables if missing
    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            f(&mut conn)
        })
        .await?
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn apply(&self, mutation: LedgerMutation) -> Result<MutationOutcome, StoreError> {
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let tenant = mutation.tenant_id.as_str();
            let kind = mutation.kind.as_str();
            let direction = mutation.direction.as_str();

            let current: u64 = tx
                .query_row(
                    "SELECT balance FROM credit_balances WHERE tenant_id = ?1 AND kind = ?2",
                    rusqlite::params![tenant, kind],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .map(i64_to_u64)
                .unwrap_or(0);

            let exists = tx
                .query_row(
                    "SELECT 1 FROM ledger_entries
                     WHERE tenant_id = ?1 AND kind = ?2 AND idempotency_token = ?3 AND direction = ?4",
                    rusqlite::params![tenant, kind, mutation.token.as_str(), direction],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Ok(MutationOutcome::Replayed { balance: current });
            }

            let next = match settle(current, mutation.direction, mutation.amount) {
                Ok(Some(next)) => next,
                // Dropping `tx` rolls back; nothing was written.
                Ok(None) => return Ok(MutationOutcome::Insufficient { balance: current }),
                Err(()) => {
                    return Err(StoreError::BalanceOverflow {
                        tenant: mutation.tenant_id.to_string(),
                        kind: mutation.kind,
                    })
                }
            };

            let ts_ms = now_millis();
            let inserted = tx.execute(
                "INSERT INTO ledger_entries
                    (tenant_id, kind, delta, direction, idempotency_token, description, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (tenant_id, kind, idempotency_token, direction) DO NOTHING",
                rusqlite::params![
                    tenant,
                    kind,
                    mutation.direction.signed(mutation.amount),
                    direction,
                    mutation.token.as_str(),
                    mutation.description,
                    ts_ms
                ],
            )?;
            if inserted == 0 {
                return Ok(MutationOutcome::Replayed { balance: current });
            }

            tx.execute(
                "INSERT INTO credit_balances (tenant_id, kind, balance, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (tenant_id, kind)
                 DO UPDATE SET balance = excluded.balance, updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![tenant, kind, u64_to_i64(next), ts_ms],
            )?;

            tx.commit()?;
            Ok(MutationOutcome::Applied { balance: next })
        })
        .await
    }

    async fn balance(&self, tenant: &TenantId, kind: CreditKind) -> Result<u64, StoreError> {
        let tenant = tenant.to_string();
        self.with_connection(move |conn| {
            let balance = conn
                .query_row(
                    "SELECT balance FROM credit_balances WHERE tenant_id = ?1 AND kind = ?2",
                    rusqlite::params![tenant, kind.as_str()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(balance.map(i64_to_u64).unwrap_or(0))
        })
        .await
    }

    async fn balances(&self, tenant: &TenantId) -> Result<Vec<CreditBalance>, StoreError> {
        let tenant = tenant.clone();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, balance FROM credit_balances WHERE tenant_id = ?1 ORDER BY kind",
            )?;
            let rows = stmt.query_map(rusqlite::params![tenant.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut balances = Vec::new();
            for row in rows {
                let (kind, balance) = row?;
                balances.push(CreditBalance {
                    tenant_id: tenant.clone(),
                    kind: parse_column(&kind, "credit_balances.kind")?,
                    balance: i64_to_u64(balance),
                });
            }
            balances.sort_by_key(|b| b.kind);
            Ok(balances)
        })
        .await
    }

    async fn entries(
        &self,
        tenant: &TenantId,
        kind: CreditKind,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let tenant = tenant.clone();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT delta, idempotency_token, description, created_at_ms
                 FROM ledger_entries
                 WHERE tenant_id = ?1 AND kind = ?2
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(rusqlite::params![tenant.as_str(), kind.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (delta, token, description, created_at_ms) = row?;
                entries.push(LedgerEntry {
                    tenant_id: tenant.clone(),
                    kind,
                    delta,
                    idempotency_token: token.into(),
                    description,
                    created_at: from_millis(created_at_ms),
                });
            }
            Ok(entries)
        })
        .await
    }
}

// =============================================================================
// Webhook events
// =============================================================================

const EVENT_COLUMNS: &str = "event_id, provider, event_type, object_type, object_id, tenant_id,
    raw_payload, matched, matched_record_id, received_at_ms, processed_at_ms";

struct EventRow {
    event_id: String,
    provider: String,
    event_type: String,
    object_type: String,
    object_id: Option<String>,
    tenant_id: Option<String>,
    raw_payload: String,
    matched: bool,
    matched_record_id: Option<String>,
    received_at_ms: i64,
    processed_at_ms: Option<i64>,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            provider: row.get(1)?,
            event_type: row.get(2)?,
            object_type: row.get(3)?,
            object_id: row.get(4)?,
            tenant_id: row.get(5)?,
            raw_payload: row.get(6)?,
            matched: row.get(7)?,
            matched_record_id: row.get(8)?,
            received_at_ms: row.get(9)?,
            processed_at_ms: row.get(10)?,
        })
    }

    fn into_event(self) -> Result<StoredEvent, StoreError> {
        Ok(StoredEvent {
            provider: parse_column(&self.provider, "webhook_events.provider")?,
            object_type: parse_column(&self.object_type, "webhook_events.object_type")?,
            raw_payload: self.raw_payload,
            event_id: self.event_id,
            event_type: self.event_type,
            object_id: self.object_id,
            tenant_id: self.tenant_id.map(TenantId::from),
            matched: self.matched,
            matched_record_id: self.matched_record_id,
            received_at: from_millis(self.received_at_ms),
            processed_at: self.processed_at_ms.map(from_millis),
        })
    }
}

fn load_event(
    conn: &rusqlite::Connection,
    event_id: &str,
) -> Result<Option<StoredEvent>, StoreError> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE event_id = ?1"),
        rusqlite::params![event_id],
        EventRow::from_row,
    )
    .optional()?
    .map(EventRow::into_event)
    .transpose()
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn record_if_new(&self, event: NewWebhookEvent) -> Result<RecordOutcome, StoreError> {
        self.with_connection(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO webhook_events
                    (event_id, provider, event_type, object_type, object_id, tenant_id,
                     raw_payload, matched, received_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
                 ON CONFLICT (event_id) DO NOTHING",
                rusqlite::params![
                    event.event_id,
                    event.provider.as_str(),
                    event.event_type,
                    event.object_type.as_str(),
                    event.object_id,
                    event.tenant_id.as_ref().map(TenantId::as_str),
                    event.raw_payload,
                    event.received_at.timestamp_millis()
                ],
            )?;

            let stored = load_event(conn, &event.event_id)?.ok_or_else(|| {
                StoreError::NotFound(format!("webhook event {}", event.event_id))
            })?;
            Ok(RecordOutcome {
                is_new: inserted == 1,
                event: stored,
            })
        })
        .await
    }

    async fn mark_matched(
        &self,
        event_id: &str,
        record_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let event_id = event_id.to_string();
        let record_id = record_id.to_string();
        self.with_connection(move |conn| {
            let updated = conn.execute(
                "UPDATE webhook_events
                 SET matched = 1, matched_record_id = ?2, processed_at_ms = ?3
                 WHERE event_id = ?1 AND matched = 0",
                rusqlite::params![event_id, record_id, processed_at.timestamp_millis()],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
        let event_id = event_id.to_string();
        self.with_connection(move |conn| load_event(conn, &event_id))
            .await
    }

    async fn list_unmatched(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM webhook_events
                 WHERE matched = 0
                 ORDER BY received_at_ms, rowid
                 LIMIT ?1"
            ))?;
            let rows = stmt.query_map(rusqlite::params![limit], EventRow::from_row)?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row?.into_event()?);
            }
            Ok(events)
        })
        .await
    }
}

// =============================================================================
// Tracked records
// =============================================================================

const RECORD_COLUMNS: &str = "id, kind, tenant_id, status, sent_at_ms, delivered_at_ms,
    seen_at_ms, replied_at_ms, accepted_at_ms, completed_at_ms, last_error,
    created_at_ms, updated_at_ms";

struct RecordRow {
    id: String,
    kind: String,
    tenant_id: String,
    status: String,
    timestamps: [Option<i64>; 6],
    last_error: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            tenant_id: row.get(2)?,
            status: row.get(3)?,
            timestamps: [
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
            ],
            last_error: row.get(10)?,
            created_at_ms: row.get(11)?,
            updated_at_ms: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<TrackedRecord, StoreError> {
        let [sent, delivered, seen, replied, accepted, completed] = self.timestamps;
        Ok(TrackedRecord {
            id: self.id,
            kind: parse_column(&self.kind, "tracked_records.kind")?,
            tenant_id: TenantId::from(self.tenant_id),
            status: parse_column(&self.status, "tracked_records.status")?,
            sent_at: sent.map(from_millis),
            delivered_at: delivered.map(from_millis),
            seen_at: seen.map(from_millis),
            replied_at: replied.map(from_millis),
            accepted_at: accepted.map(from_millis),
            completed_at: completed.map(from_millis),
            last_error: self.last_error,
            created_at: from_millis(self.created_at_ms),
            updated_at: from_millis(self.updated_at_ms),
        })
    }
}

fn load_record(
    conn: &rusqlite::Connection,
    record_id: &str,
) -> Result<Option<TrackedRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM tracked_records WHERE id = ?1"),
        rusqlite::params![record_id],
        RecordRow::from_row,
    )
    .optional()?
    .map(RecordRow::into_record)
    .transpose()
}

fn lookup_reference(
    conn: &rusqlite::Connection,
    reference: &ObjectRef,
) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT record_id FROM record_refs WHERE object_type = ?1 AND provider_object_id = ?2",
            rusqlite::params![reference.object_type.as_str(), reference.object_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create_record(&self, record: NewRecord) -> Result<TrackedRecord, StoreError> {
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(existing_id) = lookup_reference(&tx, &record.reference)? {
                return load_record(&tx, &existing_id)?
                    .ok_or_else(|| StoreError::Corrupt(format!("dangling reference to {existing_id}")));
            }

            let reference = record.reference.clone();
            let created = record.into_record(Utc::now());
            tx.execute(
                "INSERT INTO tracked_records
                    (id, kind, tenant_id, status, sent_at_ms, last_error, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)",
                rusqlite::params![
                    created.id,
                    created.kind.as_str(),
                    created.tenant_id.as_str(),
                    created.status.as_str(),
                    created.sent_at.map(|t| t.timestamp_millis()),
                    created.created_at.timestamp_millis(),
                    created.updated_at.timestamp_millis()
                ],
            )?;
            tx.execute(
                "INSERT INTO record_refs (object_type, provider_object_id, record_id)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![reference.object_type.as_str(), reference.object_id, created.id],
            )?;
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn find_record(
        &self,
        reference: &ObjectRef,
    ) -> Result<Option<TrackedRecord>, StoreError> {
        let reference = reference.clone();
        self.with_connection(move |conn| match lookup_reference(conn, &reference)? {
            Some(record_id) => load_record(conn, &record_id),
            None => Ok(None),
        })
        .await
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<TrackedRecord>, StoreError> {
        let record_id = record_id.to_string();
        self.with_connection(move |conn| load_record(conn, &record_id))
            .await
    }

    async fn apply_transition(
        &self,
        record_id: &str,
        transition: &Transition,
        context: &AuditContext,
    ) -> Result<TransitionOutcome, StoreError> {
        let record_id = record_id.to_string();
        let transition = transition.clone();
        let context = context.clone();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut record = load_record(&tx, &record_id)?
                .ok_or_else(|| StoreError::NotFound(format!("record {record_id}")))?;

            let audit = transition_record(&mut record, &transition, &context);
            if audit.changed {
                let ms = |t: Option<DateTime<Utc>>| t.map(|t| t.timestamp_millis());
                tx.execute(
                    "UPDATE tracked_records
                     SET status = ?2, sent_at_ms = ?3, delivered_at_ms = ?4, seen_at_ms = ?5,
                         replied_at_ms = ?6, accepted_at_ms = ?7, completed_at_ms = ?8,
                         last_error = ?9, updated_at_ms = ?10
                     WHERE id = ?1",
                    rusqlite::params![
                        record.id,
                        record.status.as_str(),
                        ms(record.sent_at),
                        ms(record.delivered_at),
                        ms(record.seen_at),
                        ms(record.replied_at),
                        ms(record.accepted_at),
                        ms(record.completed_at),
                        record.last_error,
                        record.updated_at.timestamp_millis()
                    ],
                )?;
            }

            tx.execute(
                "INSERT INTO audit_trail
                    (id, record_id, event_id, event_type, correlation_id,
                     previous_status, new_status, changed, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    audit.id,
                    audit.record_id,
                    audit.event_id,
                    audit.event_type,
                    audit.correlation_id,
                    audit.previous_status.as_str(),
                    audit.new_status.as_str(),
                    audit.changed,
                    audit.created_at.timestamp_millis()
                ],
            )?;
            tx.commit()?;
            Ok(TransitionOutcome { record, audit })
        })
        .await
    }

    async fn audit_trail(&self, record_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let record_id = record_id.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, record_id, event_id, event_type, correlation_id,
                        previous_status, new_status, changed, created_at_ms
                 FROM audit_trail
                 WHERE record_id = ?1
                 ORDER BY created_at_ms, rowid",
            )?;
            let rows = stmt.query_map(rusqlite::params![record_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })?;

            let mut trail = Vec::new();
            for row in rows {
                let (id, record_id, event_id, event_type, correlation_id, previous, new, changed, ts) =
                    row?;
                trail.push(AuditEntry {
                    id,
                    record_id,
                    event_id,
                    event_type,
                    correlation_id,
                    previous_status: parse_column(&previous, "audit_trail.previous_status")?,
                    new_status: parse_column(&new, "audit_trail.new_status")?,
                    changed,
                    created_at: from_millis(ts),
                });
            }
            Ok(trail)
        })
        .await
    }

    async fn register_account(
        &self,
        account_id: &str,
        tenant: &TenantId,
    ) -> Result<(), StoreError> {
        let account_id = account_id.to_string();
        let tenant = tenant.clone();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO provider_accounts (account_id, tenant_id, updated_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (account_id)
                 DO UPDATE SET tenant_id = excluded.tenant_id, updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![account_id, tenant.as_str(), now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn tenant_for_account(&self, account_id: &str) -> Result<Option<TenantId>, StoreError> {
        let account_id = account_id.to_string();
        self.with_connection(move |conn| {
            let tenant = conn
                .query_row(
                    "SELECT tenant_id FROM provider_accounts WHERE account_id = ?1",
                    rusqlite::params![account_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(tenant.map(TenantId::from))
        })
        .await
    }
}

// =============================================================================
// Schema & helpers
// =============================================================================

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credit_balances (
            tenant_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, kind)
        );

        CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            delta INTEGER NOT NULL,
            direction TEXT NOT NULL,
            idempotency_token TEXT NOT NULL,
            description TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            UNIQUE (tenant_id, kind, idempotency_token, direction)
        );

        CREATE TABLE IF NOT EXISTS webhook_events (
            event_id TEXT PRIMARY KEY NOT NULL,
            provider TEXT NOT NULL,
            event_type TEXT NOT NULL,
            object_type TEXT NOT NULL,
            object_id TEXT,
            tenant_id TEXT,
            raw_payload TEXT NOT NULL,
            matched INTEGER NOT NULL DEFAULT 0,
            matched_record_id TEXT,
            received_at_ms INTEGER NOT NULL,
            processed_at_ms INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_webhook_events_unmatched
            ON webhook_events (matched, received_at_ms);

        CREATE TABLE IF NOT EXISTS tracked_records (
            id TEXT PRIMARY KEY NOT NULL,
            kind TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            status TEXT NOT NULL,
            sent_at_ms INTEGER,
            delivered_at_ms INTEGER,
            seen_at_ms INTEGER,
            replied_at_ms INTEGER,
            accepted_at_ms INTEGER,
            completed_at_ms INTEGER,
            last_error TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS record_refs (
            object_type TEXT NOT NULL,
            provider_object_id TEXT NOT NULL,
            record_id TEXT NOT NULL REFERENCES tracked_records (id),
            PRIMARY KEY (object_type, provider_object_id)
        );

        CREATE TABLE IF NOT EXISTS audit_trail (
            id TEXT PRIMARY KEY NOT NULL,
            record_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            correlation_id TEXT NOT NULL,
            previous_status TEXT NOT NULL,
            new_status TEXT NOT NULL,
            changed INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_trail_record
            ON audit_trail (record_id, created_at_ms);

        CREATE TABLE IF NOT EXISTS provider_accounts (
            account_id TEXT PRIMARY KEY NOT NULL,
            tenant_id TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    if let Err(e) = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;") {
        warn!(error = %e, "WAL journal mode unavailable, using rollback journal");
    }
    Ok(conn)
}

fn parse_column<T: FromStr<Err = String>>(value: &str, column: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|e: String| StoreError::Corrupt(format!("{column}: {e}")))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 {
        0
    } else {
        value as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Direction;
    use crate::webhook::events::{ObjectType, Provider};
    use crate::webhook::records::{RecordKind, RecordStatus, TimestampField};

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("leadflow.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    fn mutation(direction: Direction, amount: u64, token: &str) -> LedgerMutation {
        LedgerMutation {
            tenant_id: TenantId::new("acme"),
            kind: CreditKind::PhoneReveal,
            direction,
            amount,
            token: token.into(),
            description: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn sqlite_ledger_is_idempotent_per_direction() {
        let (_dir, store) = store().await;
        store.apply(mutation(Direction::Credit, 5, "grant")).await.expect("grant");

        let debit = store.apply(mutation(Direction::Debit, 5, "t3")).await.expect("debit");
        assert_eq!(debit, MutationOutcome::Applied { balance: 0 });

        let refund = store.apply(mutation(Direction::Credit, 5, "t3")).await.expect("refund");
        assert_eq!(refund, MutationOutcome::Applied { balance: 5 });
        let again = store.apply(mutation(Direction::Credit, 5, "t3")).await.expect("replay");
        assert_eq!(again, MutationOutcome::Replayed { balance: 5 });

        let entries = store
            .entries(&"acme".into(), CreditKind::PhoneReveal)
            .await
            .expect("entries");
        assert_eq!(entries.iter().map(|e| e.delta).collect::<Vec<_>>(), vec![5, -5, 5]);
    }

    #[tokio::test]
    async fn sqlite_insufficient_debit_leaves_no_entry() {
        let (_dir, store) = store().await;
        store.apply(mutation(Direction::Credit, 5, "grant")).await.expect("grant");
        let outcome = store.apply(mutation(Direction::Debit, 20, "t2")).await.expect("debit");
        assert_eq!(outcome, MutationOutcome::Insufficient { balance: 5 });

        let entries = store
            .entries(&"acme".into(), CreditKind::PhoneReveal)
            .await
            .expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(
            store.balance(&"acme".into(), CreditKind::PhoneReveal).await.expect("balance"),
            5
        );
    }

    #[tokio::test]
    async fn sqlite_events_dedup_and_match_once() {
        let (_dir, store) = store().await;
        let event = NewWebhookEvent {
            event_id: "evt-1".into(),
            provider: Provider::Messaging,
            event_type: "message.sent".into(),
            object_type: ObjectType::Message,
            object_id: Some("m1".into()),
            tenant_id: Some("acme".into()),
            raw_payload: r#"{"event": "message.sent", "nested": {"a": [1, 2]}, "score": 0.10000000000000000001}"#.to_string(),
            received_at: Utc::now(),
        };

        let first = store.record_if_new(event.clone()).await.expect("insert");
        assert!(first.is_new);
        let second = store.record_if_new(event.clone()).await.expect("dup");
        assert!(!second.is_new);
        assert_eq!(second.event.raw_payload, event.raw_payload);

        assert_eq!(store.list_unmatched(10).await.expect("list").len(), 1);
        assert!(store.mark_matched("evt-1", "rec-1", Utc::now()).await.expect("mark"));
        assert!(!store.mark_matched("evt-1", "rec-2", Utc::now()).await.expect("mark"));
        assert!(store.list_unmatched(10).await.expect("list").is_empty());

        let stored = store.get_event("evt-1").await.expect("get").expect("exists");
        assert_eq!(stored.matched_record_id.as_deref(), Some("rec-1"));
        assert_eq!(stored.tenant_id, Some(TenantId::new("acme")));
    }

    #[tokio::test]
    async fn sqlite_records_transition_with_audit() {
        let (_dir, store) = store().await;
        let created = store
            .create_record(NewRecord {
                kind: RecordKind::CampaignLead,
                tenant_id: "acme".into(),
                reference: ObjectRef::new(ObjectType::Message, "m1"),
                status: RecordStatus::Sent,
                sent_at: Some(Utc::now()),
            })
            .await
            .expect("create");

        let found = store
            .find_record(&ObjectRef::new(ObjectType::Message, "m1"))
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(found.id, created.id);

        let context = AuditContext {
            event_id: "evt-100".into(),
            event_type: "message.delivered".into(),
            correlation_id: "corr-1".into(),
        };
        let transition = Transition::Advance {
            field: TimestampField::DeliveredAt,
            status: RecordStatus::Sent,
            at: Utc::now(),
        };
        let outcome = store
            .apply_transition(&created.id, &transition, &context)
            .await
            .expect("transition");
        assert!(outcome.changed());
        assert_eq!(outcome.record.status, RecordStatus::Sent);

        let reloaded = store.get_record(&created.id).await.expect("get").expect("exists");
        assert!(reloaded.delivered_at.is_some());

        let trail = store.audit_trail(&created.id).await.expect("audit");
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event_id, "evt-100");
    }

    #[tokio::test]
    async fn sqlite_account_directory_upserts() {
        let (_dir, store) = store().await;
        store.register_account("acc-1", &"acme".into()).await.expect("register");
        store.register_account("acc-1", &"globex".into()).await.expect("re-register");
        assert_eq!(
            store.tenant_for_account("acc-1").await.expect("lookup"),
            Some(TenantId::new("globex"))
        );
        assert_eq!(store.tenant_for_account("nope").await.expect("lookup"), None);
    }
}
