//! HarborWatch Backend Library
//!
//! Live-feed ingestion core for the vessel tracking pipeline: the upstream
//! AIS stream client and the regional rotation scheduler. Downstream
//! consumers (storage, cache, browser fan-out) subscribe to the event
//! channels these components expose; the only write path back into the core
//! is the subscription-update call driven by region changes.

pub mod models;
pub mod scheduler;
pub mod stream;

pub use models::{Config, PositionUpdate, Region, StaticData, SubscriptionFilter};
pub use scheduler::{RegionalScheduler, SchedulerConfig, SchedulerEvent};
pub use stream::{ConnectionState, StreamClientConfig, StreamConnectionClient, StreamEvent};
