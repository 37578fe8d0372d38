//! Infrastructure layer: persistence, collaborator lookups, the negotiation
//! service, the expiry reaper and configuration.

pub mod config;
pub mod directory;
pub mod error;
pub mod reaper;
pub mod repository;
pub mod service;


pub use config::{ConfigError, EngineConfig, SweepConfig};
pub use directory::{Directory, InMemoryDirectory, OrderRef};
pub use error::{RepositoryError, ServiceError};
pub use reaper::{ExpiryReaper, ReaperHandle, ReaperStats, SweepReport};
pub use repository::{
    InMemoryNegotiationRepository, NegotiationFilter, NegotiationRepository, Pagination,
    PostgresNegotiationRepository, SortField, SortOrder,
};
pub use service::{CreateNegotiation, NegotiationEnvelope, NegotiationService, Opened};
