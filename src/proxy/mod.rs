pub mod health;
pub mod manager;
pub mod model;
pub mod store;

// Re-export common types
pub use health::{HealthProbe, HttpProbe};
pub use manager::{PoolStats, ProxyOutcome, ProxyPool, SweepReport};
pub use model::{Proxy, ProxyId, ProxyProtocol};
pub use store::{MemoryProxyStore, ProxyStore};
