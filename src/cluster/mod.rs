//! Clustering: shared KV registry, membership, peer links and remote
//! routing.
//!
//! The KV store is the only place cross-node consistency is required; the
//! membership view, connection manager and cluster router are all derived
//! from it.

pub mod connmgr;
pub mod kv;
pub mod memberlist;
pub mod router;
pub mod rpc;

pub use connmgr::ConnManager;
pub use kv::{KvEvent, KvStore, KvWatch, MemoryKv};
pub use memberlist::{ApiVersion, CLUSTER_API_VERSION, ClusterMember, MemberList};
pub use router::ClusterRouter;
