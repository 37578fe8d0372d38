use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use haggle_core::{
    Aggregate, AggregateId, AggregateRoot, Currency, DomainError, DomainResult, Money, OrderId,
    TenantId, UserId, VendorId,
};
use haggle_events::Event;

use crate::history::{History, HistoryAction, HistoryEntry};
use crate::status::NegotiationStatus;
use crate::terms::{Terms, validate_note};

/// Aggregate type tag used in envelopes and logs.
pub const AGGREGATE_TYPE: &str = "negotiation";

/// Seven days, the horizon the originating workflow gave every open offer.
pub const DEFAULT_OFFER_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Negotiation identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NegotiationId(pub AggregateId);

impl NegotiationId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }

    pub fn as_aggregate_id(&self) -> AggregateId {
        self.0
    }
}

impl core::fmt::Display for NegotiationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A stored record broke a structural invariant (corruption, not a user error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("negotiation invariant violated: {0}")]
pub struct InvariantViolation(String);

impl InvariantViolation {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Policy captured when a negotiation opens.
///
/// Stored on the record so that later configuration changes never alter a
/// negotiation already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationRules {
    /// How long each offer stays open before the reaper may expire it.
    pub offer_ttl_seconds: i64,
    /// Highest round a negotiation may reach; `None` means unbounded.
    #[serde(default)]
    pub max_rounds: Option<u32>,
    /// Whether the author of the standing offer may counter their own offer.
    pub allow_self_counter: bool,
}

impl Default for NegotiationRules {
    fn default() -> Self {
        Self {
            offer_ttl_seconds: DEFAULT_OFFER_TTL_SECONDS,
            max_rounds: None,
            allow_self_counter: true,
        }
    }
}

impl NegotiationRules {
    pub fn offer_ttl(&self) -> Duration {
        Duration::seconds(self.offer_ttl_seconds)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.offer_ttl_seconds <= 0 {
            return Err(DomainError::invalid_argument("offer ttl must be positive"));
        }
        if self.max_rounds == Some(0) {
            return Err(DomainError::invalid_argument("max rounds must be at least 1"));
        }
        Ok(())
    }
}

/// Aggregate root: Negotiation.
///
/// Every mutation goes through [`Aggregate::apply`]; there are no public setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NegotiationSnapshot", into = "NegotiationSnapshot")]
pub struct Negotiation {
    id: NegotiationId,
    tenant_id: TenantId,
    order_id: OrderId,
    vendor_id: VendorId,
    status: NegotiationStatus,
    currency: Currency,
    initial_offer: Money,
    latest_offer: Money,
    round: u32,
    terms: Terms,
    history: History,
    rules: NegotiationRules,
    expires_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
}

/// Flat, storage-friendly view of a negotiation.
///
/// Converting back into a [`Negotiation`] re-checks every invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationSnapshot {
    pub id: NegotiationId,
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub vendor_id: VendorId,
    pub status: NegotiationStatus,
    pub currency: Currency,
    pub initial_offer: Money,
    pub latest_offer: Money,
    pub round: u32,
    pub terms: Terms,
    pub history: Vec<HistoryEntry>,
    pub rules: NegotiationRules,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Negotiation {
    pub fn id_typed(&self) -> NegotiationId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn vendor_id(&self) -> VendorId {
        self.vendor_id
    }

    pub fn status(&self) -> NegotiationStatus {
        self.status
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn initial_offer(&self) -> Money {
        self.initial_offer
    }

    pub fn latest_offer(&self) -> Money {
        self.latest_offer
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn terms(&self) -> &Terms {
        &self.terms
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn rules(&self) -> &NegotiationRules {
        &self.rules
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether the reaper may expire this negotiation at `now`.
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn snapshot(&self) -> NegotiationSnapshot {
        NegotiationSnapshot::from(self.clone())
    }

    /// Decide the opening event for a new negotiation.
    ///
    /// Creation has no prior state, so it lives outside [`Aggregate::handle`].
    pub fn start(cmd: &StartNegotiation) -> DomainResult<NegotiationEvent> {
        if cmd.tenant_id.is_nil() {
            return Err(DomainError::invalid_argument("tenant_id is required"));
        }
        if cmd.order_id.is_nil() {
            return Err(DomainError::invalid_argument("order_id is required"));
        }
        if cmd.vendor_id.is_nil() {
            return Err(DomainError::invalid_argument("vendor_id is required"));
        }
        if cmd.actor_id.is_nil() {
            return Err(DomainError::invalid_argument("actor_id is required"));
        }
        if cmd.negotiation_id.0.is_nil() {
            return Err(DomainError::invalid_argument("negotiation_id is required"));
        }
        if !cmd.initial_offer.is_positive() {
            return Err(DomainError::invalid_argument("initial offer must be positive"));
        }
        cmd.initial_offer.ensure_currency(cmd.currency)?;
        cmd.terms.validate()?;
        cmd.rules.validate()?;
        if let Some(note) = &cmd.note {
            validate_note(note)?;
        }

        let expires_at = match cmd.expires_at {
            Some(at) if at <= cmd.occurred_at => {
                return Err(DomainError::invalid_argument(
                    "expires_at must be after the creation time",
                ));
            }
            Some(at) => at,
            None => cmd.occurred_at + cmd.rules.offer_ttl(),
        };

        Ok(NegotiationEvent::Started(NegotiationStarted {
            tenant_id: cmd.tenant_id,
            negotiation_id: cmd.negotiation_id,
            order_id: cmd.order_id,
            vendor_id: cmd.vendor_id,
            actor_id: cmd.actor_id,
            initial_offer: cmd.initial_offer,
            terms: cmd.terms.clone(),
            rules: cmd.rules,
            note: cmd.note.clone(),
            expires_at,
            occurred_at: cmd.occurred_at,
        }))
    }

    /// Build the aggregate from its opening event.
    pub fn from_started(e: &NegotiationStarted) -> Self {
        let mut history = History::new();
        history.append(
            HistoryAction::InitialQuote,
            Some(e.initial_offer),
            Some(e.actor_id),
            e.note.clone(),
            e.occurred_at,
        );

        Self {
            id: e.negotiation_id,
            tenant_id: e.tenant_id,
            order_id: e.order_id,
            vendor_id: e.vendor_id,
            status: NegotiationStatus::Open,
            currency: e.initial_offer.currency(),
            initial_offer: e.initial_offer,
            latest_offer: e.initial_offer,
            round: 1,
            terms: e.terms.clone(),
            history,
            rules: e.rules,
            expires_at: Some(e.expires_at),
            closed_at: None,
            created_at: e.occurred_at,
            updated_at: e.occurred_at,
            version: 1,
        }
    }

    /// Re-check the structural invariants of a record.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.history.is_empty() {
            return Err(InvariantViolation::new("history is empty"));
        }
        if self.version != self.history.len() as u64 {
            return Err(InvariantViolation::new(format!(
                "version {} does not match history length {}",
                self.version,
                self.history.len()
            )));
        }
        if self.round != self.history.derived_round() {
            return Err(InvariantViolation::new(format!(
                "stored round {} disagrees with history-derived round {}",
                self.round,
                self.history.derived_round()
            )));
        }
        if self.expires_at.is_some() != self.status.is_active() {
            return Err(InvariantViolation::new(format!(
                "expires_at presence inconsistent with status {}",
                self.status
            )));
        }
        if self.closed_at.is_some() != self.status.is_terminal() {
            return Err(InvariantViolation::new(format!(
                "closed_at presence inconsistent with status {}",
                self.status
            )));
        }
        if self.initial_offer.currency() != self.currency
            || self.latest_offer.currency() != self.currency
        {
            return Err(InvariantViolation::new("offer currency differs from record"));
        }
        if self
            .history
            .iter()
            .filter_map(|e| e.offer)
            .any(|m| m.currency() != self.currency)
        {
            return Err(InvariantViolation::new("history offer currency differs from record"));
        }

        let last = self.history.last().map(|e| e.action);
        let expected_status = match last {
            Some(HistoryAction::InitialQuote) => NegotiationStatus::Open,
            Some(HistoryAction::CounterOffer) => NegotiationStatus::Countered,
            Some(HistoryAction::Accept) => NegotiationStatus::Accepted,
            Some(HistoryAction::Reject) => NegotiationStatus::Rejected,
            Some(HistoryAction::Cancel) => NegotiationStatus::Cancelled,
            Some(HistoryAction::Expire) => NegotiationStatus::Expired,
            None => return Err(InvariantViolation::new("history is empty")),
        };
        if expected_status != self.status {
            return Err(InvariantViolation::new(format!(
                "status {} disagrees with last history action",
                self.status
            )));
        }
        Ok(())
    }
}

impl From<Negotiation> for NegotiationSnapshot {
    fn from(n: Negotiation) -> Self {
        Self {
            id: n.id,
            tenant_id: n.tenant_id,
            order_id: n.order_id,
            vendor_id: n.vendor_id,
            status: n.status,
            currency: n.currency,
            initial_offer: n.initial_offer,
            latest_offer: n.latest_offer,
            round: n.round,
            terms: n.terms,
            history: n.history.into(),
            rules: n.rules,
            expires_at: n.expires_at,
            closed_at: n.closed_at,
            created_at: n.created_at,
            updated_at: n.updated_at,
            version: n.version,
        }
    }
}

impl TryFrom<NegotiationSnapshot> for Negotiation {
    type Error = InvariantViolation;

    fn try_from(s: NegotiationSnapshot) -> Result<Self, Self::Error> {
        let negotiation = Negotiation {
            id: s.id,
            tenant_id: s.tenant_id,
            order_id: s.order_id,
            vendor_id: s.vendor_id,
            status: s.status,
            currency: s.currency,
            initial_offer: s.initial_offer,
            latest_offer: s.latest_offer,
            round: s.round,
            terms: s.terms,
            history: History::from_entries(s.history)?,
            rules: s.rules,
            expires_at: s.expires_at,
            closed_at: s.closed_at,
            created_at: s.created_at,
            updated_at: s.updated_at,
            version: s.version,
        };
        negotiation.check_invariants()?;
        Ok(negotiation)
    }
}

impl AggregateRoot for Negotiation {
    type Id = NegotiationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: StartNegotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartNegotiation {
    pub tenant_id: TenantId,
    pub negotiation_id: NegotiationId,
    pub order_id: OrderId,
    pub vendor_id: VendorId,
    pub actor_id: UserId,
    pub initial_offer: Money,
    pub currency: Currency,
    pub terms: Terms,
    /// Caller-supplied expiry; defaults to `occurred_at + rules.offer_ttl()`.
    pub expires_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub rules: NegotiationRules,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CounterOffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterOffer {
    pub tenant_id: TenantId,
    pub negotiation_id: NegotiationId,
    pub actor_id: UserId,
    pub offer: Money,
    pub terms: Terms,
    pub note: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command payload shared by accept / reject / cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub tenant_id: TenantId,
    pub negotiation_id: NegotiationId,
    pub actor_id: UserId,
    pub note: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Expire (system only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expire {
    pub tenant_id: TenantId,
    pub negotiation_id: NegotiationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationCommand {
    CounterOffer(CounterOffer),
    Accept(Decision),
    Reject(Decision),
    Cancel(Decision),
    Expire(Expire),
}

impl NegotiationCommand {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            NegotiationCommand::CounterOffer(c) => c.tenant_id,
            NegotiationCommand::Accept(c)
            | NegotiationCommand::Reject(c)
            | NegotiationCommand::Cancel(c) => c.tenant_id,
            NegotiationCommand::Expire(c) => c.tenant_id,
        }
    }

    pub fn negotiation_id(&self) -> NegotiationId {
        match self {
            NegotiationCommand::CounterOffer(c) => c.negotiation_id,
            NegotiationCommand::Accept(c)
            | NegotiationCommand::Reject(c)
            | NegotiationCommand::Cancel(c) => c.negotiation_id,
            NegotiationCommand::Expire(c) => c.negotiation_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NegotiationCommand::CounterOffer(_) => "counter_offer",
            NegotiationCommand::Accept(_) => "accept",
            NegotiationCommand::Reject(_) => "reject",
            NegotiationCommand::Cancel(_) => "cancel",
            NegotiationCommand::Expire(_) => "expire",
        }
    }
}

/// Event: NegotiationStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationStarted {
    pub tenant_id: TenantId,
    pub negotiation_id: NegotiationId,
    pub order_id: OrderId,
    pub vendor_id: VendorId,
    pub actor_id: UserId,
    pub initial_offer: Money,
    pub terms: Terms,
    pub rules: NegotiationRules,
    pub note: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CounterOffered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterOffered {
    pub tenant_id: TenantId,
    pub negotiation_id: NegotiationId,
    pub actor_id: UserId,
    pub offer: Money,
    pub terms: Terms,
    /// Round reached by this counter-offer.
    pub round: u32,
    pub note: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event payload shared by accepted / rejected / cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concluded {
    pub tenant_id: TenantId,
    pub negotiation_id: NegotiationId,
    pub actor_id: UserId,
    /// Offer standing at the time of the decision.
    pub final_offer: Money,
    pub note: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: NegotiationExpired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationExpired {
    pub tenant_id: TenantId,
    pub negotiation_id: NegotiationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NegotiationEvent {
    Started(NegotiationStarted),
    CounterOffered(CounterOffered),
    Accepted(Concluded),
    Rejected(Concluded),
    Cancelled(Concluded),
    Expired(NegotiationExpired),
}

impl NegotiationEvent {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            NegotiationEvent::Started(e) => e.tenant_id,
            NegotiationEvent::CounterOffered(e) => e.tenant_id,
            NegotiationEvent::Accepted(e)
            | NegotiationEvent::Rejected(e)
            | NegotiationEvent::Cancelled(e) => e.tenant_id,
            NegotiationEvent::Expired(e) => e.tenant_id,
        }
    }

    pub fn negotiation_id(&self) -> NegotiationId {
        match self {
            NegotiationEvent::Started(e) => e.negotiation_id,
            NegotiationEvent::CounterOffered(e) => e.negotiation_id,
            NegotiationEvent::Accepted(e)
            | NegotiationEvent::Rejected(e)
            | NegotiationEvent::Cancelled(e) => e.negotiation_id,
            NegotiationEvent::Expired(e) => e.negotiation_id,
        }
    }

    /// Status the record is in after this event.
    pub fn resulting_status(&self) -> NegotiationStatus {
        match self {
            NegotiationEvent::Started(_) => NegotiationStatus::Open,
            NegotiationEvent::CounterOffered(_) => NegotiationStatus::Countered,
            NegotiationEvent::Accepted(_) => NegotiationStatus::Accepted,
            NegotiationEvent::Rejected(_) => NegotiationStatus::Rejected,
            NegotiationEvent::Cancelled(_) => NegotiationStatus::Cancelled,
            NegotiationEvent::Expired(_) => NegotiationStatus::Expired,
        }
    }
}

impl Event for NegotiationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            NegotiationEvent::Started(_) => "negotiation.started",
            NegotiationEvent::CounterOffered(_) => "negotiation.countered",
            NegotiationEvent::Accepted(_) => "negotiation.accepted",
            NegotiationEvent::Rejected(_) => "negotiation.rejected",
            NegotiationEvent::Cancelled(_) => "negotiation.cancelled",
            NegotiationEvent::Expired(_) => "negotiation.expired",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            NegotiationEvent::Started(e) => e.occurred_at,
            NegotiationEvent::CounterOffered(e) => e.occurred_at,
            NegotiationEvent::Accepted(e)
            | NegotiationEvent::Rejected(e)
            | NegotiationEvent::Cancelled(e) => e.occurred_at,
            NegotiationEvent::Expired(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Negotiation {
    type Command = NegotiationCommand;
    type Event = NegotiationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            NegotiationEvent::Started(e) => {
                // Replaying the opening event resets the record.
                *self = Negotiation::from_started(e);
                return;
            }
            NegotiationEvent::CounterOffered(e) => {
                self.status = NegotiationStatus::Countered;
                self.latest_offer = e.offer;
                self.terms = e.terms.clone();
                self.round = e.round;
                self.expires_at = Some(e.expires_at);
                self.history.append(
                    HistoryAction::CounterOffer,
                    Some(e.offer),
                    Some(e.actor_id),
                    e.note.clone(),
                    e.occurred_at,
                );
                self.updated_at = e.occurred_at;
            }
            NegotiationEvent::Accepted(e) => {
                self.close(NegotiationStatus::Accepted, e.occurred_at);
                self.history.append(
                    HistoryAction::Accept,
                    None,
                    Some(e.actor_id),
                    e.note.clone(),
                    e.occurred_at,
                );
            }
            NegotiationEvent::Rejected(e) => {
                self.close(NegotiationStatus::Rejected, e.occurred_at);
                self.history.append(
                    HistoryAction::Reject,
                    None,
                    Some(e.actor_id),
                    e.note.clone(),
                    e.occurred_at,
                );
            }
            NegotiationEvent::Cancelled(e) => {
                self.close(NegotiationStatus::Cancelled, e.occurred_at);
                self.history.append(
                    HistoryAction::Cancel,
                    None,
                    Some(e.actor_id),
                    e.note.clone(),
                    e.occurred_at,
                );
            }
            NegotiationEvent::Expired(e) => {
                self.close(NegotiationStatus::Expired, e.occurred_at);
                self.history
                    .append(HistoryAction::Expire, None, None, None, e.occurred_at);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        self.ensure_scope(command.tenant_id(), command.negotiation_id())?;

        match command {
            NegotiationCommand::CounterOffer(cmd) => self.handle_counter(cmd),
            NegotiationCommand::Accept(cmd) => {
                self.handle_decision(cmd, NegotiationStatus::Accepted)
            }
            NegotiationCommand::Reject(cmd) => {
                self.handle_decision(cmd, NegotiationStatus::Rejected)
            }
            NegotiationCommand::Cancel(cmd) => {
                self.handle_decision(cmd, NegotiationStatus::Cancelled)
            }
            NegotiationCommand::Expire(cmd) => self.handle_expire(cmd),
        }
    }
}

impl Negotiation {
    fn close(&mut self, status: NegotiationStatus, at: DateTime<Utc>) {
        self.status = status;
        self.expires_at = None;
        if self.closed_at.is_none() {
            self.closed_at = Some(at);
        }
        self.updated_at = at;
    }

    fn ensure_scope(
        &self,
        tenant_id: TenantId,
        negotiation_id: NegotiationId,
    ) -> Result<(), DomainError> {
        // Another tenant's record is indistinguishable from a missing one.
        if self.tenant_id != tenant_id || self.id != negotiation_id {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn ensure_transition(&self, next: NegotiationStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_state(format!(
                "cannot move negotiation from {} to {}",
                self.status, next
            )));
        }
        Ok(())
    }

    fn ensure_not_before_last_update(&self, at: DateTime<Utc>) -> Result<(), DomainError> {
        if at < self.updated_at {
            return Err(DomainError::invalid_argument(format!(
                "action time {at} precedes last update {}",
                self.updated_at
            )));
        }
        Ok(())
    }

    fn handle_counter(&self, cmd: &CounterOffer) -> Result<Vec<NegotiationEvent>, DomainError> {
        self.ensure_transition(NegotiationStatus::Countered)?;

        if let Some(max) = self.rules.max_rounds {
            if self.round >= max {
                return Err(DomainError::invalid_state(format!(
                    "negotiation reached the maximum of {max} rounds"
                )));
            }
        }
        if !self.rules.allow_self_counter && self.history.last_offer_actor() == Some(cmd.actor_id)
        {
            return Err(DomainError::invalid_state(
                "the author of the standing offer cannot counter it",
            ));
        }

        if cmd.actor_id.is_nil() {
            return Err(DomainError::invalid_argument("actor_id is required"));
        }
        if !cmd.offer.is_positive() {
            return Err(DomainError::invalid_argument("counter offer must be positive"));
        }
        cmd.offer.ensure_currency(self.currency)?;
        cmd.terms.validate()?;
        if let Some(note) = &cmd.note {
            validate_note(note)?;
        }
        self.ensure_not_before_last_update(cmd.occurred_at)?;

        Ok(vec![NegotiationEvent::CounterOffered(CounterOffered {
            tenant_id: cmd.tenant_id,
            negotiation_id: cmd.negotiation_id,
            actor_id: cmd.actor_id,
            offer: cmd.offer,
            terms: cmd.terms.clone(),
            round: self.round + 1,
            note: cmd.note.clone(),
            expires_at: cmd.occurred_at + self.rules.offer_ttl(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_decision(
        &self,
        cmd: &Decision,
        outcome: NegotiationStatus,
    ) -> Result<Vec<NegotiationEvent>, DomainError> {
        self.ensure_transition(outcome)?;

        if cmd.actor_id.is_nil() {
            return Err(DomainError::invalid_argument("actor_id is required"));
        }
        if let Some(note) = &cmd.note {
            validate_note(note)?;
        }
        self.ensure_not_before_last_update(cmd.occurred_at)?;

        let concluded = Concluded {
            tenant_id: cmd.tenant_id,
            negotiation_id: cmd.negotiation_id,
            actor_id: cmd.actor_id,
            final_offer: self.latest_offer,
            note: cmd.note.clone(),
            occurred_at: cmd.occurred_at,
        };

        let event = match outcome {
            NegotiationStatus::Accepted => NegotiationEvent::Accepted(concluded),
            NegotiationStatus::Rejected => NegotiationEvent::Rejected(concluded),
            NegotiationStatus::Cancelled => NegotiationEvent::Cancelled(concluded),
            other => {
                return Err(DomainError::invalid_state(format!(
                    "{other} is not a decision outcome"
                )));
            }
        };
        Ok(vec![event])
    }

    fn handle_expire(&self, cmd: &Expire) -> Result<Vec<NegotiationEvent>, DomainError> {
        self.ensure_transition(NegotiationStatus::Expired)?;

        if !self.is_due_for_expiry(cmd.occurred_at) {
            return Err(DomainError::invalid_state(format!(
                "negotiation is not due for expiry at {}",
                cmd.occurred_at
            )));
        }

        Ok(vec![NegotiationEvent::Expired(NegotiationExpired {
            tenant_id: cmd.tenant_id,
            negotiation_id: cmd.negotiation_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
