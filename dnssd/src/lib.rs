pub mod browse;
pub mod cache;
pub mod config;
pub mod dns;
mod engine;
pub mod error;
mod publish;
mod query;
mod schedule;
pub mod service;
pub mod transport;

pub use browse::{BrowseStream, DiscoveryEvent, Resolver};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use publish::{PublishState, PublishStatus, PublishedService};
pub use service::{publish_service, PublishHandle, ServiceBuilder, ServiceDescriptor, DEFAULT_REGISTER_TIMEOUT};
pub use shared::types::DiscoveredService;
