pub mod regions; // Built-in rotation zones
pub mod rotation; // Rotation schedule + timers

pub use regions::default_regions;
pub use rotation::{RegionalScheduler, SchedulerConfig, SchedulerEvent};
