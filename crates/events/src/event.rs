use chrono::{DateTime, Utc};

/// A domain event.
///
/// Events are facts: immutable, versioned for schema evolution, and only ever
/// appended.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "negotiation.countered").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time, supplied by the caller).
    fn occurred_at(&self) -> DateTime<Utc>;
}
