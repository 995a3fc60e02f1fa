//! cmon core library
//!
//! Cache synchronization and metrics routing for the cmon metrics discovery
//! gateway: an in-memory view of running VMs and compute nodes kept current
//! from the inventory changefeed, and a proxy that routes tenant metrics
//! requests to the agent on the right host.

pub mod authz;
pub mod backoff;
pub mod cache;
pub mod clients;
pub mod config;
pub mod discovery;
pub mod error;
pub mod normalize;
pub mod observability;
pub mod proxy;
pub mod resolver;
pub mod sync;
pub mod types;

// Re-export commonly used items
pub use authz::{authorize, HostPrefix};
pub use cache::{Cache, CacheChange, CacheStats};
pub use config::Config;
pub use error::{CmonError, Result};
pub use normalize::{CacheEvent, ChangeNotice};
pub use observability::{
    health::HealthChecker, init as init_observability, shutdown as shutdown_observability,
};
pub use proxy::{MetricsProxy, MetricsResponse, MetricsStream, StreamEnd};
pub use resolver::{AdminResolver, ResolveOutcome};
pub use sync::{FeedSignal, ItemPipeline, SyncEngine, SyncState};
pub use types::{Caller, HostEntry, HostRecord, VmRecord, VmState};
