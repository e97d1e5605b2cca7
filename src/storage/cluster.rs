//! Cluster view used by consensus groups
//!
//! Groups only need to know which members are reachable (to decide whether a
//! quorum exists) and where to publish the leader they elected.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub node_id: u64,
    pub address: String,
    pub alive: bool,
}

pub trait Cluster: Send + Sync {
    /// Every configured member and whether it is reachable
    fn members(&self) -> Vec<Member>;

    /// Leader currently known for a shard
    fn current_leader_for(&self, shard_id: u64) -> Option<u64>;

    /// Publish the leader of a shard, `None` when it stepped down
    fn record_leader(&self, shard_id: u64, leader: Option<u64>);
}

/// Fixed membership from configuration. Only the local node is considered
/// alive until told otherwise.
pub struct StaticCluster {
    node_id: u64,
    members: RwLock<BTreeMap<u64, Member>>,
    leaders: RwLock<HashMap<u64, u64>>,
}

impl StaticCluster {
    pub fn new(node_id: u64, addresses: &BTreeMap<u64, String>) -> Self {
        let members = addresses
            .iter()
            .map(|(id, address)| {
                (
                    *id,
                    Member {
                        node_id: *id,
                        address: address.clone(),
                        alive: *id == node_id,
                    },
                )
            })
            .collect();

        Self {
            node_id,
            members: RwLock::new(members),
            leaders: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Mark a member reachable or not, unknown members are ignored
    pub fn set_alive(&self, node_id: u64, alive: bool) {
        if let Some(member) = self.members.write().unwrap().get_mut(&node_id) {
            if member.alive != alive {
                tracing::info!(node_id, alive, "Member liveness changed");
            }
            member.alive = alive;
        }
    }
}

impl Cluster for StaticCluster {
    fn members(&self) -> Vec<Member> {
        self.members.read().unwrap().values().cloned().collect()
    }

    fn current_leader_for(&self, shard_id: u64) -> Option<u64> {
        self.leaders.read().unwrap().get(&shard_id).copied()
    }

    fn record_leader(&self, shard_id: u64, leader: Option<u64>) {
        let mut leaders = self.leaders.write().unwrap();
        match leader {
            Some(id) => {
                leaders.insert(shard_id, id);
            }
            None => {
                leaders.remove(&shard_id);
            }
        }
    }
}

/// Whether a strict majority of `members` is alive in `cluster`
pub fn has_quorum(cluster: &dyn Cluster, members: &BTreeMap<u64, String>) -> bool {
    if members.is_empty() {
        return false;
    }
    let alive = cluster
        .members()
        .into_iter()
        .filter(|m| m.alive && members.contains_key(&m.node_id))
        .count();
    alive > members.len() / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> BTreeMap<u64, String> {
        (1..=3).map(|id| (id, format!("10.0.0.{}:5012", id))).collect()
    }

    #[test]
    fn test_single_node_has_quorum() {
        let members = BTreeMap::from([(1, "127.0.0.1:5012".to_string())]);
        let cluster = StaticCluster::new(1, &members);
        assert!(has_quorum(&cluster, &members));
    }

    #[test]
    fn test_quorum_follows_liveness() {
        let members = three_nodes();
        let cluster = StaticCluster::new(1, &members);
        assert!(!has_quorum(&cluster, &members));

        cluster.set_alive(2, true);
        assert!(has_quorum(&cluster, &members));

        cluster.set_alive(2, false);
        cluster.set_alive(9, true);
        assert!(!has_quorum(&cluster, &members));
    }

    #[test]
    fn test_leader_registry() {
        let cluster = StaticCluster::new(1, &three_nodes());
        assert_eq!(cluster.current_leader_for(10001), None);

        cluster.record_leader(10001, Some(1));
        assert_eq!(cluster.current_leader_for(10001), Some(1));

        cluster.record_leader(10001, None);
        assert_eq!(cluster.current_leader_for(10001), None);
    }
}
