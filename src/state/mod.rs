//! Node-local shared state: the stream hub, the distributed resource map
//! client, and parked stream-management queues.

pub mod hub;
pub mod resources;
pub mod smqueue;

pub use hub::{StreamHandle, StreamHub};
pub use resources::{RegisterOutcome, ResourceDescriptor, ResourceManager};
pub use smqueue::{SmQueueRegistry, SmState};
