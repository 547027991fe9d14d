//! State Management Module
//!
//! Cluster membership, the election state machine, and the supervisor
//! that manages the active data-plane role.

mod membership;
pub mod election;
mod supervisor;

pub use election::{ClusterState, ElectionCoordinator, NodeRole};
pub use membership::{ClusterMembership, NodeDescriptor};
pub use supervisor::Supervisor;
