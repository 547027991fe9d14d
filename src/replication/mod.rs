//! Replication Module
//!
//! Handles log replication between the leader and follower roles:
//! the wire protocol, the leader's client/replication servers, and the
//! follower's catch-up and read-only servers.

pub mod protocol;
mod leader;
mod follower;

pub use follower::FollowerNode;
pub use leader::{FollowerStatus, LeaderNode};
pub use protocol::{ClientCommand, ControlFrame, ReplicationFrame};
