//! Negotiation service: the only writer of negotiation records.
//!
//! Every transition runs the same pipeline:
//!
//! ```text
//! Command
//!   ↓
//! 1. Load record from the repository (tenant-scoped)
//!   ↓
//! 2. Decide events (pure, no mutation)
//!   ↓
//! 3. Apply events to a copy of the record
//!   ↓
//! 4. Save with the loaded version as the expectation (optimistic concurrency)
//!   ↓
//! 5. Publish committed events to the bus
//! ```
//!
//! A stale save fails with `Conflict` and is never retried here; the caller
//! decides whether to reload and try again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use haggle_core::{
    Aggregate, AggregateRoot, Currency, DomainError, ExpectedVersion, Money, OrderId, TenantId,
    UserId, VendorId,
};
use haggle_events::{EventBus, EventEnvelope};
use haggle_negotiation::{
    AGGREGATE_TYPE, CounterOffer, Decision, Expire, HistoryEntry, Negotiation, NegotiationCommand,
    NegotiationEvent, NegotiationId, NegotiationRules, StartNegotiation, Terms,
};

use crate::directory::Directory;
use crate::error::ServiceError;
use crate::repository::{NegotiationFilter, NegotiationRepository, Pagination};

/// Input for opening a negotiation. Identity and rules are assigned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNegotiation {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub vendor_id: VendorId,
    pub actor_id: UserId,
    pub initial_offer: Money,
    pub currency: Currency,
    #[serde(default)]
    pub terms: Terms,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Result of [`NegotiationService::open_or_resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    Created(Negotiation),
    Resumed(Negotiation),
}

impl Opened {
    pub fn was_created(&self) -> bool {
        matches!(self, Opened::Created(_))
    }

    pub fn into_inner(self) -> Negotiation {
        match self {
            Opened::Created(n) | Opened::Resumed(n) => n,
        }
    }
}

pub type NegotiationEnvelope = EventEnvelope<NegotiationEvent>;

#[derive(Debug)]
pub struct NegotiationService<R, D, B> {
    repository: R,
    directory: D,
    bus: B,
    rules: NegotiationRules,
}

impl<R, D, B> NegotiationService<R, D, B> {
    pub fn new(repository: R, directory: D, bus: B, rules: NegotiationRules) -> Self {
        Self {
            repository,
            directory,
            bus,
            rules,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Rules stamped onto negotiations created from now on.
    pub fn rules(&self) -> &NegotiationRules {
        &self.rules
    }
}

impl<R, D, B> NegotiationService<R, D, B>
where
    R: NegotiationRepository,
    D: Directory,
    B: EventBus<NegotiationEnvelope>,
{
    /// Open a new negotiation for an order/vendor pair.
    pub fn create_negotiation(
        &self,
        req: CreateNegotiation,
        now: DateTime<Utc>,
    ) -> Result<Negotiation, ServiceError> {
        let cmd = StartNegotiation {
            tenant_id: req.tenant_id,
            negotiation_id: NegotiationId::generate(),
            order_id: req.order_id,
            vendor_id: req.vendor_id,
            actor_id: req.actor_id,
            initial_offer: req.initial_offer,
            currency: req.currency,
            terms: req.terms,
            expires_at: req.expires_at,
            note: req.note,
            rules: self.rules,
            occurred_at: now,
        };

        let started = Negotiation::start(&cmd)?;
        self.check_references(&cmd)?;

        let negotiation = match &started {
            NegotiationEvent::Started(e) => Negotiation::from_started(e),
            other => {
                return Err(ServiceError::Infrastructure(format!(
                    "start produced unexpected event {}",
                    haggle_events::Event::event_type(other)
                )));
            }
        };

        self.repository.insert(&negotiation)?;
        info!(
            tenant_id = %negotiation.tenant_id(),
            negotiation_id = %negotiation.id_typed(),
            order_id = %negotiation.order_id(),
            vendor_id = %negotiation.vendor_id(),
            offer = %negotiation.initial_offer(),
            "negotiation opened"
        );

        self.publish(&negotiation, 1, vec![started])?;
        Ok(negotiation)
    }

    /// Return the active negotiation for the order/vendor pair, or open one.
    pub fn open_or_resume(
        &self,
        req: CreateNegotiation,
        now: DateTime<Utc>,
    ) -> Result<Opened, ServiceError> {
        let filter = NegotiationFilter {
            order_id: Some(req.order_id),
            vendor_id: Some(req.vendor_id),
            pagination: Pagination::new(Some(Pagination::MAX_LIMIT), None),
            ..NegotiationFilter::default()
        };
        let existing = self
            .repository
            .list(req.tenant_id, &filter)?
            .into_iter()
            .find(|n| n.status().is_active());

        match existing {
            Some(n) => Ok(Opened::Resumed(n)),
            None => self.create_negotiation(req, now).map(Opened::Created),
        }
    }

    pub fn counter_offer(&self, cmd: CounterOffer) -> Result<Negotiation, ServiceError> {
        self.execute(NegotiationCommand::CounterOffer(cmd))
    }

    pub fn accept(&self, cmd: Decision) -> Result<Negotiation, ServiceError> {
        self.execute(NegotiationCommand::Accept(cmd))
    }

    pub fn reject(&self, cmd: Decision) -> Result<Negotiation, ServiceError> {
        self.execute(NegotiationCommand::Reject(cmd))
    }

    pub fn cancel(&self, cmd: Decision) -> Result<Negotiation, ServiceError> {
        self.execute(NegotiationCommand::Cancel(cmd))
    }

    /// System expiry; only the reaper calls this.
    pub(crate) fn expire(
        &self,
        tenant_id: TenantId,
        negotiation_id: NegotiationId,
        now: DateTime<Utc>,
    ) -> Result<Negotiation, ServiceError> {
        self.execute(NegotiationCommand::Expire(Expire {
            tenant_id,
            negotiation_id,
            occurred_at: now,
        }))
    }

    pub fn get_negotiation(
        &self,
        tenant_id: TenantId,
        negotiation_id: NegotiationId,
    ) -> Result<Negotiation, ServiceError> {
        Ok(self.repository.get(tenant_id, negotiation_id)?)
    }

    pub fn list_negotiations(
        &self,
        tenant_id: TenantId,
        filter: &NegotiationFilter,
    ) -> Result<Vec<Negotiation>, ServiceError> {
        Ok(self.repository.list(tenant_id, filter)?)
    }

    pub fn list_history(
        &self,
        tenant_id: TenantId,
        negotiation_id: NegotiationId,
    ) -> Result<Vec<HistoryEntry>, ServiceError> {
        let negotiation = self.repository.get(tenant_id, negotiation_id)?;
        Ok(negotiation.history().entries().to_vec())
    }

    fn execute(&self, command: NegotiationCommand) -> Result<Negotiation, ServiceError> {
        let tenant_id = command.tenant_id();
        let negotiation_id = command.negotiation_id();

        // 1) Load (tenant-scoped)
        let current = self.repository.get(tenant_id, negotiation_id)?;
        let expected = ExpectedVersion::Exact(current.version());

        // 2) Decide
        let decided = current.handle(&command)?;
        if decided.is_empty() {
            return Ok(current);
        }

        // 3) Apply to a copy
        let mut next = current.clone();
        for event in &decided {
            next.apply(event);
        }

        // 4) Persist with optimistic concurrency
        self.repository.save(&next, expected)?;
        info!(
            tenant_id = %tenant_id,
            negotiation_id = %negotiation_id,
            command = command.name(),
            from = %current.status(),
            to = %next.status(),
            round = next.round(),
            version = next.version(),
            "negotiation transition committed"
        );

        // 5) Publish
        self.publish(&next, current.version() + 1, decided)?;
        Ok(next)
    }

    fn check_references(&self, cmd: &StartNegotiation) -> Result<(), ServiceError> {
        let order = self
            .directory
            .order(cmd.tenant_id, cmd.order_id)
            .ok_or_else(|| DomainError::invalid_argument(format!("unknown order {}", cmd.order_id)))?;
        if !self.directory.vendor_exists(cmd.tenant_id, cmd.vendor_id) {
            return Err(
                DomainError::invalid_argument(format!("unknown vendor {}", cmd.vendor_id)).into(),
            );
        }
        if order.currency != cmd.currency {
            return Err(DomainError::invalid_argument(format!(
                "currency {} does not match order currency {}",
                cmd.currency, order.currency
            ))
            .into());
        }
        Ok(())
    }

    /// Publish committed events; `first_sequence` is the history position of the first one.
    fn publish(
        &self,
        negotiation: &Negotiation,
        first_sequence: u64,
        events: Vec<NegotiationEvent>,
    ) -> Result<(), ServiceError> {
        for (offset, event) in events.into_iter().enumerate() {
            let envelope = EventEnvelope::wrap(
                negotiation.tenant_id(),
                negotiation.id_typed().as_aggregate_id(),
                AGGREGATE_TYPE,
                first_sequence + offset as u64,
                event,
            );
            self.bus.publish(envelope).map_err(|err| {
                warn!(
                    negotiation_id = %negotiation.id_typed(),
                    error = ?err,
                    "event publication failed after commit"
                );
                ServiceError::Infrastructure(format!("event publication failed: {err:?}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};
    use haggle_events::InMemoryEventBus;
    use haggle_negotiation::{HistoryAction, NegotiationStatus};

    use crate::directory::InMemoryDirectory;
    use crate::repository::InMemoryNegotiationRepository;

    type Service = NegotiationService<
        Arc<InMemoryNegotiationRepository>,
        Arc<InMemoryDirectory>,
        Arc<InMemoryEventBus<NegotiationEnvelope>>,
    >;

    struct Fixture {
        service: Service,
        bus: Arc<InMemoryEventBus<NegotiationEnvelope>>,
        request: CreateNegotiation,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 20, 10, 0, 0).unwrap()
    }

    fn idr() -> Currency {
        Currency::new("IDR").unwrap()
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(InMemoryDirectory::new());
        let tenant_id = TenantId::new();
        let order_id = OrderId::new();
        let vendor_id = VendorId::new();
        directory.add_order(tenant_id, order_id, idr());
        directory.add_vendor(tenant_id, vendor_id);

        let bus = Arc::new(InMemoryEventBus::new());
        let service = NegotiationService::new(
            Arc::new(InMemoryNegotiationRepository::new()),
            directory,
            bus.clone(),
            NegotiationRules::default(),
        );

        Fixture {
            service,
            bus,
            request: CreateNegotiation {
                tenant_id,
                order_id,
                vendor_id,
                actor_id: UserId::new(),
                initial_offer: Money::new(100_000_000, idr()),
                currency: idr(),
                terms: Terms::default(),
                expires_at: None,
                note: None,
            },
        }
    }

    fn decision(n: &Negotiation, at: DateTime<Utc>) -> Decision {
        Decision {
            tenant_id: n.tenant_id(),
            negotiation_id: n.id_typed(),
            actor_id: UserId::new(),
            note: None,
            occurred_at: at,
        }
    }

    #[test]
    fn create_persists_and_publishes_sequence_one() {
        let f = fixture();
        let sub = f.bus.subscribe();

        let n = f.service.create_negotiation(f.request.clone(), t0()).unwrap();
        assert_eq!(
            f.service.get_negotiation(n.tenant_id(), n.id_typed()).unwrap(),
            n
        );

        let published = sub.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].sequence_number(), 1);
        assert_eq!(published[0].event_type(), "negotiation.started");
        assert_eq!(published[0].aggregate_id(), n.id_typed().as_aggregate_id());
    }

    #[test]
    fn unknown_references_are_invalid_arguments() {
        let f = fixture();

        let mut unknown_order = f.request.clone();
        unknown_order.order_id = OrderId::new();
        assert!(matches!(
            f.service.create_negotiation(unknown_order, t0()),
            Err(ServiceError::InvalidArgument(_))
        ));

        let mut unknown_vendor = f.request.clone();
        unknown_vendor.vendor_id = VendorId::new();
        assert!(matches!(
            f.service.create_negotiation(unknown_vendor, t0()),
            Err(ServiceError::InvalidArgument(_))
        ));

        let usd = Currency::new("USD").unwrap();
        let mut wrong_currency = f.request.clone();
        wrong_currency.currency = usd;
        wrong_currency.initial_offer = Money::new(5_000, usd);
        assert!(matches!(
            f.service.create_negotiation(wrong_currency, t0()),
            Err(ServiceError::InvalidArgument(_))
        ));

        assert!(f.service.repository().is_empty());
    }

    #[test]
    fn decisions_publish_next_sequence() {
        let f = fixture();
        let n = f.service.create_negotiation(f.request.clone(), t0()).unwrap();
        let sub = f.bus.subscribe();

        let rejected = f
            .service
            .reject(decision(&n, t0() + Duration::minutes(1)))
            .unwrap();
        assert_eq!(rejected.status(), NegotiationStatus::Rejected);

        let published = sub.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].sequence_number(), 2);
        assert_eq!(published[0].event_type(), "negotiation.rejected");
    }

    #[test]
    fn open_or_resume_returns_active_negotiation() {
        let f = fixture();
        let first = f.service.open_or_resume(f.request.clone(), t0()).unwrap();
        assert!(first.was_created());
        let first = first.into_inner();

        let again = f
            .service
            .open_or_resume(f.request.clone(), t0() + Duration::minutes(5))
            .unwrap();
        assert!(!again.was_created());
        assert_eq!(again.into_inner(), first);

        f.service
            .cancel(decision(&first, t0() + Duration::minutes(6)))
            .unwrap();
        let fresh = f
            .service
            .open_or_resume(f.request.clone(), t0() + Duration::minutes(7))
            .unwrap();
        assert!(fresh.was_created());
        assert_ne!(fresh.into_inner().id_typed(), first.id_typed());
    }

    #[test]
    fn history_lists_every_transition_in_order() {
        let f = fixture();
        let n = f.service.create_negotiation(f.request.clone(), t0()).unwrap();
        f.service
            .counter_offer(CounterOffer {
                tenant_id: n.tenant_id(),
                negotiation_id: n.id_typed(),
                actor_id: UserId::new(),
                offer: Money::new(110_000_000, idr()),
                terms: Terms::default(),
                note: Some("includes installation".into()),
                occurred_at: t0() + Duration::hours(1),
            })
            .unwrap();
        f.service
            .accept(decision(&n, t0() + Duration::hours(2)))
            .unwrap();

        let actions: Vec<HistoryAction> = f
            .service
            .list_history(n.tenant_id(), n.id_typed())
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                HistoryAction::InitialQuote,
                HistoryAction::CounterOffer,
                HistoryAction::Accept
            ]
        );
    }
}
