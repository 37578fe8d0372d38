use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use haggle_core::{AggregateRoot, ExpectedVersion, TenantId};
use haggle_negotiation::{Negotiation, NegotiationId};

use super::{NegotiationFilter, NegotiationRepository};
use crate::error::RepositoryError;

/// In-memory negotiation store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryNegotiationRepository {
    records: RwLock<HashMap<NegotiationId, Negotiation>>,
}

impl InMemoryNegotiationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::Backend("lock poisoned".to_string())
}

impl NegotiationRepository for InMemoryNegotiationRepository {
    fn get(&self, tenant_id: TenantId, id: NegotiationId) -> Result<Negotiation, RepositoryError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        records
            .get(&id)
            .filter(|n| n.tenant_id() == tenant_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    fn save(
        &self,
        negotiation: &Negotiation,
        expected_version: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        negotiation.check_invariants()?;

        let mut records = self.records.write().map_err(|_| poisoned())?;
        let id = negotiation.id_typed();
        let current = records.get(&id);

        if let Some(existing) = current {
            if existing.tenant_id() != negotiation.tenant_id() {
                // Never overwrite or reveal another tenant's record.
                return Err(RepositoryError::NotFound);
            }
        }

        let actual = current.map(|n| n.version());
        if !expected_version.matches(actual) {
            return Err(RepositoryError::Conflict(format!(
                "expected {expected_version:?}, found {actual:?}"
            )));
        }
        if let Some(stored) = actual {
            if negotiation.version() <= stored {
                return Err(RepositoryError::Conflict(format!(
                    "save does not advance version {stored}"
                )));
            }
        }

        records.insert(id, negotiation.clone());
        Ok(())
    }

    fn find_due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Negotiation>, RepositoryError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut due: Vec<Negotiation> = records
            .values()
            .filter(|n| n.is_due_for_expiry(now))
            .cloned()
            .collect();
        due.sort_by_key(|n| (n.expires_at(), *n.id_typed().0.as_uuid()));
        due.truncate(limit);
        Ok(due)
    }

    fn list(
        &self,
        tenant_id: TenantId,
        filter: &NegotiationFilter,
    ) -> Result<Vec<Negotiation>, RepositoryError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut matching: Vec<Negotiation> = records
            .values()
            .filter(|n| n.tenant_id() == tenant_id && filter.matches(n))
            .cloned()
            .collect();
        drop(records);

        filter.sort(&mut matching);
        Ok(matching
            .into_iter()
            .skip(filter.pagination.offset as usize)
            .take(filter.pagination.limit as usize)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use haggle_core::{Aggregate, Currency, Money, OrderId, UserId, VendorId};
    use haggle_negotiation::{
        Decision, NegotiationCommand, NegotiationEvent, NegotiationRules, NegotiationStatus,
        StartNegotiation, Terms,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap()
    }

    fn open(tenant_id: TenantId, at: DateTime<Utc>) -> Negotiation {
        let currency = Currency::new("IDR").unwrap();
        let cmd = StartNegotiation {
            tenant_id,
            negotiation_id: NegotiationId::generate(),
            order_id: OrderId::new(),
            vendor_id: VendorId::new(),
            actor_id: UserId::new(),
            initial_offer: Money::new(10_000, currency),
            currency,
            terms: Terms::default(),
            expires_at: Some(at + Duration::hours(1)),
            note: None,
            rules: NegotiationRules::default(),
            occurred_at: at,
        };
        match Negotiation::start(&cmd).unwrap() {
            NegotiationEvent::Started(e) => Negotiation::from_started(&e),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn cancelled(n: &Negotiation) -> Negotiation {
        let cmd = NegotiationCommand::Cancel(Decision {
            tenant_id: n.tenant_id(),
            negotiation_id: n.id_typed(),
            actor_id: UserId::new(),
            note: None,
            occurred_at: n.updated_at(),
        });
        let mut next = n.clone();
        for ev in n.handle(&cmd).unwrap() {
            next.apply(&ev);
        }
        next
    }

    #[test]
    fn insert_then_get_is_tenant_scoped() {
        let repo = InMemoryNegotiationRepository::new();
        let tenant = TenantId::new();
        let n = open(tenant, t0());
        repo.insert(&n).unwrap();

        assert_eq!(repo.get(tenant, n.id_typed()).unwrap(), n);
        assert!(matches!(
            repo.get(TenantId::new(), n.id_typed()),
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(repo.insert(&n), Err(RepositoryError::Conflict(_))));
    }

    #[test]
    fn stale_save_is_a_conflict() {
        let repo = InMemoryNegotiationRepository::new();
        let n = open(TenantId::new(), t0());
        repo.insert(&n).unwrap();

        let next = cancelled(&n);
        repo.save(&next, ExpectedVersion::Exact(1)).unwrap();
        assert!(matches!(
            repo.save(&next, ExpectedVersion::Exact(1)),
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(
            repo.get(n.tenant_id(), n.id_typed()).unwrap().status(),
            NegotiationStatus::Cancelled
        );
    }

    #[test]
    fn due_scan_spans_tenants_and_respects_limit() {
        let repo = InMemoryNegotiationRepository::new();
        let a = open(TenantId::new(), t0());
        let b = open(TenantId::new(), t0() + Duration::minutes(10));
        let closed = cancelled(&open(TenantId::new(), t0()));
        for n in [&a, &b, &closed] {
            repo.insert(n).unwrap();
        }

        let now = t0() + Duration::hours(2);
        let due = repo.find_due_for_expiry(now, 10).unwrap();
        let ids: Vec<_> = due.iter().map(|n| n.id_typed()).collect();
        assert_eq!(ids, vec![a.id_typed(), b.id_typed()]);

        assert_eq!(repo.find_due_for_expiry(now, 1).unwrap().len(), 1);
        assert!(repo.find_due_for_expiry(t0(), 10).unwrap().is_empty());
    }
}
