//! Cluster membership and quorum arithmetic.
//!
//! A [`ClusterConfig`] is carried whole inside every ConfigChange log entry.
//! Changes are single-member: [`ClusterConfig::with_added`] and
//! [`ClusterConfig::with_removed`] produce the next configuration, which the
//! leader proposes and adopts as soon as it is appended.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub address: String,
    /// Non-voting members receive replication but count toward no quorum.
    pub voting: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub members: BTreeMap<NodeId, Member>,
}

impl ClusterConfig {
    /// Bootstrap configuration: this node plus every configured peer, all voting.
    /// A node joining an existing cluster starts empty and learns its
    /// configuration from the leader.
    pub fn from_node_config(config: &NodeConfig) -> Self {
        if config.join_existing {
            return Self::default();
        }
        let mut members = BTreeMap::new();
        members.insert(
            config.node_id,
            Member {
                address: config.advertise_addr.clone(),
                voting: true,
            },
        );
        for peer in &config.peers {
            members.insert(
                peer.node_id,
                Member {
                    address: peer.addr.clone(),
                    voting: true,
                },
            );
        }
        Self { members }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.members.get(&id).is_some_and(|m| m.voting)
    }

    pub fn voters(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members
            .iter()
            .filter(|(_, m)| m.voting)
            .map(|(id, _)| *id)
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// Strict majority of the voting members.
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Every member except `me`, voting or not.
    pub fn peers(&self, me: NodeId) -> impl Iterator<Item = (NodeId, &Member)> + '_ {
        self.members
            .iter()
            .filter(move |(id, _)| **id != me)
            .map(|(id, m)| (*id, m))
    }

    pub fn address_of(&self, id: NodeId) -> Option<&str> {
        self.members.get(&id).map(|m| m.address.as_str())
    }

    /// Next configuration with `id` added as a voting member.
    pub fn with_added(&self, id: NodeId, address: impl Into<String>) -> Result<Self> {
        if self.contains(id) {
            return Err(RaftError::AlreadyMember(id));
        }
        let mut next = self.clone();
        next.members.insert(
            id,
            Member {
                address: address.into(),
                voting: true,
            },
        );
        Ok(next)
    }

    /// Next configuration with `id` removed.
    pub fn with_removed(&self, id: NodeId) -> Result<Self> {
        if !self.contains(id) {
            return Err(RaftError::UnknownMember(id));
        }
        let mut next = self.clone();
        next.members.remove(&id);
        Ok(next)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Highest index stored on a majority of voters.
    ///
    /// `own_last` is the leader's last log index; it only counts when the
    /// leader is itself a voter. Returns 0 if there are no voters.
    pub fn committed_index(
        &self,
        me: NodeId,
        own_last: u64,
        match_index: &HashMap<NodeId, u64>,
    ) -> u64 {
        let mut matched: Vec<u64> = self
            .voters()
            .map(|id| {
                if id == me {
                    own_last
                } else {
                    match_index.get(&id).copied().unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return 0;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched[self.quorum() - 1]
    }
}
