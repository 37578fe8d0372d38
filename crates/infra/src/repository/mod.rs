//! Negotiation persistence boundary.
//!
//! The service and the reaper only see [`NegotiationRepository`]; the backing
//! store is chosen at wiring time.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use haggle_core::{ExpectedVersion, OrderId, TenantId, VendorId};
use haggle_negotiation::{Negotiation, NegotiationId, NegotiationStatus};

use crate::error::RepositoryError;

pub use in_memory::InMemoryNegotiationRepository;
pub use postgres::PostgresNegotiationRepository;

/// Pagination parameters for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Round,
    /// Alphabetical by status name, matching the stored text column.
    Status,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter criteria for tenant-scoped listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationFilter {
    pub status: Option<NegotiationStatus>,
    pub order_id: Option<OrderId>,
    pub vendor_id: Option<VendorId>,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub pagination: Pagination,
}

impl NegotiationFilter {
    pub fn matches(&self, n: &Negotiation) -> bool {
        self.status.is_none_or(|s| n.status() == s)
            && self.order_id.is_none_or(|o| n.order_id() == o)
            && self.vendor_id.is_none_or(|v| n.vendor_id() == v)
    }

    /// Sort in place according to `sort_by`/`order`; ties break on id.
    pub fn sort(&self, items: &mut [Negotiation]) {
        items.sort_by(|a, b| {
            let primary = match self.sort_by {
                SortField::CreatedAt => a.created_at().cmp(&b.created_at()),
                SortField::UpdatedAt => a.updated_at().cmp(&b.updated_at()),
                SortField::Round => a.round().cmp(&b.round()),
                SortField::Status => a.status().as_str().cmp(b.status().as_str()),
            };
            let primary = match self.order {
                SortOrder::Asc => primary,
                SortOrder::Desc => primary.reverse(),
            };
            primary.then_with(|| a.id_typed().0.as_uuid().cmp(b.id_typed().0.as_uuid()))
        });
    }
}

/// Tenant-scoped negotiation store with optimistic concurrency.
///
/// Implementations must:
/// - never return a record to a caller of a different tenant (report `NotFound`)
/// - reject `save` when the stored version differs from the expectation
/// - persist the record and its new history entries atomically
pub trait NegotiationRepository: Send + Sync {
    fn get(&self, tenant_id: TenantId, id: NegotiationId) -> Result<Negotiation, RepositoryError>;

    /// Persist `negotiation` if the stored version satisfies `expected_version`.
    ///
    /// `ExpectedVersion::NoRecord` creates; `Exact(v)` replaces a record
    /// currently at version `v`.
    fn save(
        &self,
        negotiation: &Negotiation,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError>;

    /// Store a brand-new record; `Conflict` if the id is taken.
    fn insert(&self, negotiation: &Negotiation) -> Result<(), RepositoryError> {
        self.save(negotiation, ExpectedVersion::NoRecord)
    }

    /// Active records (any tenant) whose `expires_at <= now`, oldest expiry first.
    fn find_due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Negotiation>, RepositoryError>;

    fn list(
        &self,
        tenant_id: TenantId,
        filter: &NegotiationFilter,
    ) -> Result<Vec<Negotiation>, RepositoryError>;
}

impl<R> NegotiationRepository for Arc<R>
where
    R: NegotiationRepository + ?Sized,
{
    fn get(&self, tenant_id: TenantId, id: NegotiationId) -> Result<Negotiation, RepositoryError> {
        (**self).get(tenant_id, id)
    }

    fn save(
        &self,
        negotiation: &Negotiation,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        (**self).save(negotiation, expected_version)
    }

    fn insert(&self, negotiation: &Negotiation) -> Result<(), RepositoryError> {
        (**self).insert(negotiation)
    }

    fn find_due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Negotiation>, RepositoryError> {
        (**self).find_due_for_expiry(now, limit)
    }

    fn list(
        &self,
        tenant_id: TenantId,
        filter: &NegotiationFilter,
    ) -> Result<Vec<Negotiation>, RepositoryError> {
        (**self).list(tenant_id, filter)
    }
}
