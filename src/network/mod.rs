//! Network edge: listeners, transports and the per-connection stream
//! state machines.

pub mod c2s;
pub mod component;
pub mod gateway;
pub mod transport;

pub use c2s::{C2SDeps, C2SHandle, C2SState, spawn_c2s};
pub use component::{ComponentDeps, ComponentState, spawn_component};
pub use gateway::Gateway;
pub use transport::{Transport, TransportError};
