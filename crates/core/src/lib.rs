pub mod config;
pub mod error;
pub mod memory;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{FunnelError, FunnelResult};
pub use memory::{InMemoryStore, Snapshot};
pub use store::{EventStore, StoreClient, TrackingSink};
