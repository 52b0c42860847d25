//! Inter-node RPC: wire frames, the serving side, and the dialing side.

pub mod client;
pub mod server;
pub mod wire;

pub use client::Conn;
pub use server::{RpcHandler, RpcServer};
pub use wire::{QueuedElement, RpcFault, TransferredQueue};
