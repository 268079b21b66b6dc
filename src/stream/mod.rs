//! Published-stream machinery: coordination, broadcast, stats.

pub mod broadcast;
pub mod coordinator;
pub mod placeholder;
pub mod stats;

pub use broadcast::{Broadcaster, ClientGuard};
pub use coordinator::{Coordinator, CoordinatorConfig, DedupRing};
pub use placeholder::PlaceholderCache;
pub use stats::PipelineStats;
