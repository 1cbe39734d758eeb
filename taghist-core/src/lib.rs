//! Acquisition pipeline: tag address parsing, device polling with merged
//! read windows, per-session change fan-out and historization into the
//! day-sharded store.

pub mod address;
pub mod codec;
pub mod device;
pub mod historian;
pub mod planner;
pub mod scheduler;
pub mod sim;
pub mod subscription;

pub use address::{AddressCache, AddressKind, TagAddress};
pub use device::{ClientFactory, DeviceClient, SourceRegistry};
pub use historian::Historian;
pub use scheduler::{PollScheduler, PollerMetrics};
pub use sim::SimDevice;
pub use subscription::{DeliverFn, SessionRegistry};
