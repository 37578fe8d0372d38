//! Postgres-backed negotiation repository.
//!
//! Records live in `negotiations`; history entries in `negotiation_events`,
//! keyed by `(negotiation_id, sequence)`. The schema ships in
//! `migrations/0001_negotiations.sql`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any | `Backend` |
//! | Decode / ColumnNotFound | N/A | `Corrupted` |
//! | PoolClosed / Io / other | N/A | `Backend` |
//!
//! ## Sync bridge
//!
//! [`NegotiationRepository`] is synchronous. The trait impl drives the async
//! queries on the runtime handle captured at construction, so it must be
//! called from a plain thread (a reaper thread, a `spawn_blocking` task), never
//! from inside an async task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{Span, instrument};
use uuid::Uuid;

use haggle_core::{
    AggregateRoot, Currency, ExpectedVersion, Money, OrderId, TenantId, UserId, VendorId,
};
use haggle_negotiation::{
    HistoryAction, HistoryEntry, Negotiation, NegotiationId, NegotiationRules,
    NegotiationSnapshot, NegotiationStatus, Terms,
};

use super::{NegotiationFilter, NegotiationRepository, SortField, SortOrder};
use crate::error::RepositoryError;

const SCHEMA: &str = include_str!("../../migrations/0001_negotiations.sql");

const RECORD_COLUMNS: &str = r#"
    id, tenant_id, order_id, vendor_id, status, currency,
    initial_offer_minor, latest_offer_minor, round, terms, rules,
    expires_at, closed_at, created_at, updated_at, version
"#;

/// Postgres-backed negotiation store.
#[derive(Debug, Clone)]
pub struct PostgresNegotiationRepository {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresNegotiationRepository {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect using `database_url`, binding the sync bridge to the current runtime.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    /// Apply the bundled schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, negotiation_id = %id),
        err
    )]
    pub async fn load(
        &self,
        tenant_id: TenantId,
        id: NegotiationId,
    ) -> Result<Negotiation, RepositoryError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM negotiations WHERE id = $1 AND tenant_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(id.0.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?
            .ok_or(RepositoryError::NotFound)?;

        let record = RecordRow::from_row(&row)?;
        let mut history = self.load_history(&[record.id]).await?;
        let entries = history.remove(&record.id).unwrap_or_default();
        record.into_negotiation(entries)
    }

    /// Persist a record and append its new history entries in one transaction.
    #[instrument(
        skip(self, negotiation),
        fields(
            tenant_id = %negotiation.tenant_id(),
            negotiation_id = %negotiation.id_typed(),
            version = negotiation.version(),
            expected_version = ?expected_version,
            appended_entries = tracing::field::Empty
        ),
        err
    )]
    pub async fn store(
        &self,
        negotiation: &Negotiation,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        negotiation.check_invariants()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let already_persisted = match expected_version {
            ExpectedVersion::NoRecord => {
                insert_record(&mut tx, negotiation).await?;
                0
            }
            ExpectedVersion::Exact(v) => {
                if negotiation.version() <= v {
                    return Err(RepositoryError::Conflict(format!(
                        "save does not advance version {v}"
                    )));
                }
                update_record(&mut tx, negotiation, v).await?;
                v
            }
        };

        let mut appended = 0usize;
        for entry in negotiation
            .history()
            .iter()
            .filter(|e| e.sequence > already_persisted)
        {
            insert_entry(&mut tx, negotiation, entry).await?;
            appended += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("appended_entries", appended);
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Negotiation>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM negotiations
            WHERE status IN ('open', 'countered') AND expires_at <= $1
            ORDER BY expires_at ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("due_for_expiry", e))?;

        self.hydrate(rows).await
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id), err)]
    pub async fn query(
        &self,
        tenant_id: TenantId,
        filter: &NegotiationFilter,
    ) -> Result<Vec<Negotiation>, RepositoryError> {
        let column = match filter.sort_by {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Round => "round",
            SortField::Status => "status",
        };
        let direction = match filter.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM negotiations
            WHERE tenant_id = $1
                AND ($2::text IS NULL OR status = $2)
                AND ($3::uuid IS NULL OR order_id = $3)
                AND ($4::uuid IS NULL OR vendor_id = $4)
            ORDER BY {column} {direction}, id ASC
            LIMIT $5 OFFSET $6
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.order_id.map(|o| *o.as_uuid()))
            .bind(filter.vendor_id.map(|v| *v.as_uuid()))
            .bind(i64::from(filter.pagination.limit))
            .bind(i64::from(filter.pagination.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;

        self.hydrate(rows).await
    }

    async fn hydrate(&self, rows: Vec<PgRow>) -> Result<Vec<Negotiation>, RepositoryError> {
        let records = rows
            .iter()
            .map(RecordRow::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut history = self.load_history(&ids).await?;

        records
            .into_iter()
            .map(|r| {
                let entries = history.remove(&r.id).unwrap_or_default();
                r.into_negotiation(entries)
            })
            .collect()
    }

    async fn load_history(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<HistoryEntry>>, RepositoryError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT negotiation_id, sequence, action, offer_minor, actor_id, note, occurred_at,
                   n.currency AS currency
            FROM negotiation_events e
            JOIN negotiations n ON n.id = e.negotiation_id
            WHERE e.negotiation_id = ANY($1)
            ORDER BY negotiation_id, sequence ASC
            "#,
        )
        .bind(ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_history", e))?;

        let mut by_record: HashMap<Uuid, Vec<HistoryEntry>> = HashMap::new();
        for row in &rows {
            let owner: Uuid = row.try_get("negotiation_id").map_err(corrupted)?;
            by_record.entry(owner).or_default().push(entry_from_row(row)?);
        }
        Ok(by_record)
    }
}

impl NegotiationRepository for PostgresNegotiationRepository {
    fn get(&self, tenant_id: TenantId, id: NegotiationId) -> Result<Negotiation, RepositoryError> {
        self.block_on(self.load(tenant_id, id))
    }

    fn save(
        &self,
        negotiation: &Negotiation,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        self.block_on(self.store(negotiation, expected_version))
    }

    fn find_due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Negotiation>, RepositoryError> {
        self.block_on(self.due_for_expiry(now, limit))
    }

    fn list(
        &self,
        tenant_id: TenantId,
        filter: &NegotiationFilter,
    ) -> Result<Vec<Negotiation>, RepositoryError> {
        self.block_on(self.query(tenant_id, filter))
    }
}

async fn insert_record(
    tx: &mut Transaction<'_, Postgres>,
    n: &Negotiation,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        r#"
        INSERT INTO negotiations (
            id, tenant_id, order_id, vendor_id, status, currency,
            initial_offer_minor, latest_offer_minor, round, terms, rules,
            expires_at, closed_at, created_at, updated_at, version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(n.id_typed().0.as_uuid())
    .bind(n.tenant_id().as_uuid())
    .bind(n.order_id().as_uuid())
    .bind(n.vendor_id().as_uuid())
    .bind(n.status().as_str())
    .bind(n.currency().code())
    .bind(n.initial_offer().amount_minor())
    .bind(n.latest_offer().amount_minor())
    .bind(round_column(n.round()))
    .bind(Json(n.terms()))
    .bind(Json(n.rules()))
    .bind(n.expires_at())
    .bind(n.closed_at())
    .bind(n.created_at())
    .bind(n.updated_at())
    .bind(version_column(n.version()))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_record", e))?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::Conflict(format!(
            "negotiation {} already exists",
            n.id_typed()
        )));
    }
    Ok(())
}

async fn update_record(
    tx: &mut Transaction<'_, Postgres>,
    n: &Negotiation,
    expected: u64,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        r#"
        UPDATE negotiations
        SET status = $3,
            latest_offer_minor = $4,
            round = $5,
            terms = $6,
            expires_at = $7,
            closed_at = $8,
            updated_at = $9,
            version = $10
        WHERE id = $1 AND tenant_id = $2 AND version = $11
        "#,
    )
    .bind(n.id_typed().0.as_uuid())
    .bind(n.tenant_id().as_uuid())
    .bind(n.status().as_str())
    .bind(n.latest_offer().amount_minor())
    .bind(round_column(n.round()))
    .bind(Json(n.terms()))
    .bind(n.expires_at())
    .bind(n.closed_at())
    .bind(n.updated_at())
    .bind(version_column(n.version()))
    .bind(version_column(expected))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_record", e))?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::Conflict(format!(
            "negotiation {} is no longer at version {expected}",
            n.id_typed()
        )));
    }
    Ok(())
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    n: &Negotiation,
    entry: &HistoryEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        INSERT INTO negotiation_events (
            negotiation_id, sequence, tenant_id, action, offer_minor, actor_id, note, occurred_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(n.id_typed().0.as_uuid())
    .bind(version_column(entry.sequence))
    .bind(n.tenant_id().as_uuid())
    .bind(entry.action.as_str())
    .bind(entry.offer.map(|m| m.amount_minor()))
    .bind(entry.actor_id.map(|a| *a.as_uuid()))
    .bind(entry.note.as_deref())
    .bind(entry.timestamp)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            RepositoryError::Conflict(format!(
                "history entry {} already exists",
                entry.sequence
            ))
        } else {
            map_sqlx_error("insert_entry", e)
        }
    })?;
    Ok(())
}

fn round_column(round: u32) -> i32 {
    i32::try_from(round).unwrap_or(i32::MAX)
}

fn version_column(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn corrupted(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Corrupted(format!("failed to read row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => RepositoryError::Conflict(msg),
                _ => RepositoryError::Backend(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            RepositoryError::Corrupted(format!("decode failure in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Backend(format!("connection pool closed in {operation}"))
        }
        _ => RepositoryError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct RecordRow {
    id: Uuid,
    tenant_id: Uuid,
    order_id: Uuid,
    vendor_id: Uuid,
    status: String,
    currency: String,
    initial_offer_minor: i64,
    latest_offer_minor: i64,
    round: i32,
    terms: Terms,
    rules: NegotiationRules,
    expires_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl RecordRow {
    fn from_row(row: &PgRow) -> Result<Self, RepositoryError> {
        let terms: Json<Terms> = row.try_get("terms").map_err(corrupted)?;
        let rules: Json<NegotiationRules> = row.try_get("rules").map_err(corrupted)?;
        Ok(RecordRow {
            id: row.try_get("id").map_err(corrupted)?,
            tenant_id: row.try_get("tenant_id").map_err(corrupted)?,
            order_id: row.try_get("order_id").map_err(corrupted)?,
            vendor_id: row.try_get("vendor_id").map_err(corrupted)?,
            status: row.try_get("status").map_err(corrupted)?,
            currency: row.try_get("currency").map_err(corrupted)?,
            initial_offer_minor: row.try_get("initial_offer_minor").map_err(corrupted)?,
            latest_offer_minor: row.try_get("latest_offer_minor").map_err(corrupted)?,
            round: row.try_get("round").map_err(corrupted)?,
            terms: terms.0,
            rules: rules.0,
            expires_at: row.try_get("expires_at").map_err(corrupted)?,
            closed_at: row.try_get("closed_at").map_err(corrupted)?,
            created_at: row.try_get("created_at").map_err(corrupted)?,
            updated_at: row.try_get("updated_at").map_err(corrupted)?,
            version: row.try_get("version").map_err(corrupted)?,
        })
    }

    fn into_negotiation(self, history: Vec<HistoryEntry>) -> Result<Negotiation, RepositoryError> {
        let currency = parse_currency(&self.currency)?;
        let status: NegotiationStatus = self
            .status
            .parse()
            .map_err(|e| RepositoryError::Corrupted(format!("{e}")))?;
        let round = u32::try_from(self.round)
            .map_err(|_| RepositoryError::Corrupted(format!("negative round {}", self.round)))?;
        let version = u64::try_from(self.version)
            .map_err(|_| RepositoryError::Corrupted(format!("negative version {}", self.version)))?;

        let snapshot = NegotiationSnapshot {
            id: NegotiationId::new(self.id.into()),
            tenant_id: TenantId::from_uuid(self.tenant_id),
            order_id: OrderId::from_uuid(self.order_id),
            vendor_id: VendorId::from_uuid(self.vendor_id),
            status,
            currency,
            initial_offer: Money::new(self.initial_offer_minor, currency),
            latest_offer: Money::new(self.latest_offer_minor, currency),
            round,
            terms: self.terms,
            history,
            rules: self.rules,
            expires_at: self.expires_at,
            closed_at: self.closed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version,
        };
        Ok(Negotiation::try_from(snapshot)?)
    }
}

fn parse_currency(code: &str) -> Result<Currency, RepositoryError> {
    Currency::new(code.trim()).map_err(|e| RepositoryError::Corrupted(format!("{e}")))
}

fn entry_from_row(row: &PgRow) -> Result<HistoryEntry, RepositoryError> {
    let sequence: i64 = row.try_get("sequence").map_err(corrupted)?;
    let action: String = row.try_get("action").map_err(corrupted)?;
    let offer_minor: Option<i64> = row.try_get("offer_minor").map_err(corrupted)?;
    let actor_id: Option<Uuid> = row.try_get("actor_id").map_err(corrupted)?;
    let currency: String = row.try_get("currency").map_err(corrupted)?;
    let currency = parse_currency(&currency)?;

    Ok(HistoryEntry {
        sequence: u64::try_from(sequence)
            .map_err(|_| RepositoryError::Corrupted(format!("negative sequence {sequence}")))?,
        action: action
            .parse::<HistoryAction>()
            .map_err(|e| RepositoryError::Corrupted(format!("{e}")))?,
        offer: offer_minor.map(|m| Money::new(m, currency)),
        actor_id: actor_id.map(UserId::from_uuid),
        note: row.try_get("note").map_err(corrupted)?,
        timestamp: row.try_get("occurred_at").map_err(corrupted)?,
    })
}
