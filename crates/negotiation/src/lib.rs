//! `haggle-negotiation`: the negotiation aggregate.
//!
//! A negotiation is a bounded exchange of offers between a buyer and a vendor
//! over a single order. It opens with an initial quote, moves through any
//! number of counter-offers, and ends exactly once: accepted, rejected,
//! cancelled, or expired by the reaper. Nothing here performs IO.

pub mod history;
pub mod negotiation;
pub mod status;
pub mod terms;

pub use history::{History, HistoryAction, HistoryEntry};
pub use negotiation::{
    AGGREGATE_TYPE, Concluded, CounterOffer, CounterOffered, DEFAULT_OFFER_TTL_SECONDS, Decision,
    Expire, InvariantViolation, Negotiation, NegotiationCommand, NegotiationEvent,
    NegotiationExpired, NegotiationId, NegotiationRules, NegotiationSnapshot, NegotiationStarted,
    StartNegotiation,
};
pub use status::NegotiationStatus;
pub use terms::{PaymentMethod, ShippingTerms, Terms};
