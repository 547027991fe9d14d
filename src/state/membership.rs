//! Cluster Membership
//!
//! The static cluster member table and the port/quorum arithmetic
//! derived from it. Membership is fixed at startup; dynamic membership
//! changes are out of scope.

use crate::config::WolfKvConfig;
use crate::error::{Error, Result};

/// Static information about one cluster member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Logical node id (>= 1)
    pub id: u32,
    /// IP or DNS name
    pub host: String,
    /// Control-plane port (heartbeats, votes, status)
    pub control_port: u16,
}

impl NodeDescriptor {
    /// Control-plane address as host:port
    pub fn control_address(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }
}

/// Fixed view of the cluster from one member
#[derive(Debug, Clone)]
pub struct ClusterMembership {
    self_id: u32,
    members: Vec<NodeDescriptor>,
    client_port: u16,
    repl_port: u16,
    read_port_base: u16,
}

impl ClusterMembership {
    pub fn from_config(config: &WolfKvConfig) -> Result<Self> {
        let members: Vec<NodeDescriptor> = config
            .cluster
            .members
            .iter()
            .map(|m| NodeDescriptor {
                id: m.id,
                host: m.host.clone(),
                control_port: m.control_port,
            })
            .collect();

        if !members.iter().any(|m| m.id == config.node.id) {
            return Err(Error::Config(format!(
                "node {} missing from cluster table",
                config.node.id
            )));
        }

        Ok(Self {
            self_id: config.node.id,
            members,
            client_port: config.cluster.client_port,
            repl_port: config.cluster.repl_port,
            read_port_base: config.cluster.read_port_base,
        })
    }

    /// This node's id
    pub fn self_id(&self) -> u32 {
        self.self_id
    }

    /// This node's descriptor
    pub fn self_node(&self) -> &NodeDescriptor {
        self.node(self.self_id).expect("self must be in the table")
    }

    /// Cluster size N
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Every member, including self
    pub fn members(&self) -> &[NodeDescriptor] {
        &self.members
    }

    /// Every member except self
    pub fn peers(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.members.iter().filter(move |m| m.id != self.self_id)
    }

    /// Look up a member by id
    pub fn node(&self, id: u32) -> Option<&NodeDescriptor> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Votes needed to win an election: a strict majority of all
    /// configured members
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Leader's client command port
    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    /// Leader's replication port
    pub fn repl_port(&self) -> u16 {
        self.repl_port
    }

    /// Read-only port of a follower
    pub fn read_port(&self, node_id: u32) -> u16 {
        self.read_port_base + node_id as u16
    }
}
