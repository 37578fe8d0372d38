//! `haggle-events`: event mechanics shared by the domain and infrastructure.
//!
//! Domain crates define typed events; this crate only knows how to wrap them in
//! tenant-scoped envelopes and fan them out to subscribers.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
