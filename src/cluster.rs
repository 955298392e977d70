//! Cluster topology: `CLUSTER NODES` parsing and health assessment.

use std::collections::HashSet;

use serde::Serialize;

use crate::error::RedisOpsError;

pub const CLUSTER_SLOTS: usize = 16384;

/// One line of `CLUSTER NODES` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    /// `host:port` with the bus port and hostname stripped.
    pub address: String,
    pub flags: Vec<String>,
    pub master_id: Option<String>,
    pub link_state: String,
    /// Inclusive slot ranges owned by this node.
    pub slots: Vec<(u16, u16)>,
}

impl ClusterNode {
    /// Parse a single `CLUSTER NODES` line.
    pub fn parse(line: &str) -> Result<Self, RedisOpsError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            return Err(RedisOpsError::Command(format!(
                "malformed CLUSTER NODES line: '{line}'"
            )));
        }

        // ip:port@cport[,hostname]
        let address = parts[1]
            .split(['@', ','])
            .next()
            .unwrap_or_default()
            .to_string();

        let mut slots = Vec::new();
        for token in &parts[8..] {
            // Importing/migrating markers look like [slot->-id] / [slot-<-id].
            if token.starts_with('[') {
                continue;
            }
            let range = match token.split_once('-') {
                Some((start, end)) => (start.parse::<u16>(), end.parse::<u16>()),
                None => (token.parse::<u16>(), token.parse::<u16>()),
            };
            match range {
                (Ok(start), Ok(end)) if start <= end && (end as usize) < CLUSTER_SLOTS => {
                    slots.push((start, end))
                }
                _ => {
                    return Err(RedisOpsError::Command(format!(
                        "invalid slot range '{token}' for node {}",
                        parts[0]
                    )))
                }
            }
        }

        Ok(Self {
            id: parts[0].to_string(),
            address,
            flags: parts[2].split(',').map(str::to_string).collect(),
            master_id: (parts[3] != "-").then(|| parts[3].to_string()),
            link_state: parts[7].to_string(),
            slots,
        })
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_master(&self) -> bool {
        self.has_flag("master")
    }

    pub fn is_replica(&self) -> bool {
        self.has_flag("slave") || self.has_flag("replica")
    }

    /// Flagged `fail` by the cluster (or `fail?` by the answering node).
    pub fn is_failed(&self) -> bool {
        self.has_flag("fail") || self.has_flag("fail?")
    }

    pub fn has_address(&self) -> bool {
        !self.has_flag("noaddr") && !self.address.is_empty() && !self.address.starts_with(':')
    }

    /// A node that has not learned its own IP yet lists itself as `:port`.
    /// It is the node that answered, so it is reachable all the same.
    pub fn is_self_without_host(&self) -> bool {
        self.has_flag("myself") && self.address.starts_with(':')
    }

    /// Fill in the host of a `:port` address.
    pub fn assign_host(&mut self, host: &str) {
        if self.address.starts_with(':') {
            self.address = if host.contains(':') {
                format!("[{host}]{}", self.address)
            } else {
                format!("{host}{}", self.address)
            };
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots
            .iter()
            .map(|(start, end)| (*end - *start) as usize + 1)
            .sum()
    }
}

/// Parse the full `CLUSTER NODES` reply.
pub fn parse_cluster_nodes(raw: &str) -> Result<Vec<ClusterNode>, RedisOpsError> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ClusterNode::parse)
        .collect()
}

/// A node a cluster-wide operation could not complete on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    pub node: String,
    pub error: String,
}

impl NodeFailure {
    pub fn new(node: impl Into<String>, error: &RedisOpsError) -> Self {
        Self {
            node: node.into(),
            error: error.to_string(),
        }
    }
}

/// The error for a fan-out where no master answered.
pub fn unreachable_masters(failures: &[NodeFailure]) -> RedisOpsError {
    let nodes: Vec<&str> = failures.iter().map(|f| f.node.as_str()).collect();
    RedisOpsError::Connection(format!(
        "no master node could be reached: {}",
        nodes.join(", ")
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Replica,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeDescriptor {
    pub id: String,
    pub address: String,
    pub role: NodeRole,
    pub reachable: bool,
    pub flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_id: Option<String>,
    pub link_state: String,
    pub slots: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    /// Every node reachable and every slot served.
    Healthy,
    /// Some nodes unreachable, but every slot is still served.
    Degraded,
    /// Some slots have no reachable master.
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterIssue {
    pub kind: String,
    pub count: usize,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterTopologySnapshot {
    pub verdict: HealthVerdict,
    pub nodes: Vec<NodeDescriptor>,
    pub unreachable_nodes: Vec<String>,
    pub total_nodes: usize,
    pub master_nodes: usize,
    pub replica_nodes: usize,
    pub slots_covered: usize,
    pub slot_coverage_complete: bool,
    pub issues: Vec<ClusterIssue>,
}

impl ClusterTopologySnapshot {
    /// Combine the parsed topology with the set of addresses that failed a
    /// direct probe. Nodes flagged `fail` count as unreachable as well.
    pub fn assess(nodes: &[ClusterNode], probe_failures: &HashSet<String>) -> Self {
        let is_reachable = |node: &ClusterNode| {
            (node.has_address() || node.is_self_without_host())
                && !node.is_failed()
                && !probe_failures.contains(&node.address)
        };

        let mut covered = vec![false; CLUSTER_SLOTS];
        for node in nodes.iter().filter(|n| n.is_master() && is_reachable(n)) {
            for (start, end) in &node.slots {
                for slot in *start..=*end {
                    covered[slot as usize] = true;
                }
            }
        }
        let slots_covered = covered.iter().filter(|c| **c).count();
        let slot_coverage_complete = slots_covered == CLUSTER_SLOTS;

        let descriptors: Vec<NodeDescriptor> = nodes
            .iter()
            .map(|node| NodeDescriptor {
                id: node.id.clone(),
                address: node.address.clone(),
                role: if node.is_master() {
                    NodeRole::Master
                } else if node.is_replica() {
                    NodeRole::Replica
                } else {
                    NodeRole::Unknown
                },
                reachable: is_reachable(node),
                flags: node.flags.clone(),
                master_id: node.master_id.clone(),
                link_state: node.link_state.clone(),
                slots: node
                    .slots
                    .iter()
                    .map(|(s, e)| if s == e { s.to_string() } else { format!("{s}-{e}") })
                    .collect(),
            })
            .collect();

        let unreachable_nodes: Vec<String> = descriptors
            .iter()
            .filter(|d| !d.reachable)
            .map(|d| d.address.clone())
            .collect();

        let mut issues = Vec::new();
        let mut push_issue = |kind: &str, nodes: Vec<String>| {
            if !nodes.is_empty() {
                issues.push(ClusterIssue {
                    kind: kind.to_string(),
                    count: nodes.len(),
                    nodes,
                });
            }
        };
        push_issue(
            "failed_nodes",
            nodes
                .iter()
                .filter(|n| n.is_failed())
                .map(|n| n.address.clone())
                .collect(),
        );
        push_issue(
            "handshake_nodes",
            nodes
                .iter()
                .filter(|n| n.has_flag("handshake"))
                .map(|n| n.address.clone())
                .collect(),
        );
        push_issue("unreachable_nodes", unreachable_nodes.clone());
        push_issue(
            "masters_without_replicas",
            nodes
                .iter()
                .filter(|m| m.is_master() && m.slot_count() > 0)
                .filter(|m| !nodes.iter().any(|n| n.master_id.as_deref() == Some(m.id.as_str())))
                .map(|m| m.address.clone())
                .collect(),
        );
        if !slot_coverage_complete {
            issues.push(ClusterIssue {
                kind: "uncovered_slots".to_string(),
                count: CLUSTER_SLOTS - slots_covered,
                nodes: Vec::new(),
            });
        }

        let verdict = if !slot_coverage_complete {
            HealthVerdict::Partial
        } else if unreachable_nodes.is_empty() {
            HealthVerdict::Healthy
        } else {
            HealthVerdict::Degraded
        };

        Self {
            verdict,
            total_nodes: descriptors.len(),
            master_nodes: nodes.iter().filter(|n| n.is_master()).count(),
            replica_nodes: nodes.iter().filter(|n| n.is_replica()).count(),
            nodes: descriptors,
            unreachable_nodes,
            slots_covered,
            slot_coverage_complete,
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_MASTERS: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004,node-4 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460 [5461->-67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1]
";

    #[test]
    fn test_parse_cluster_nodes() {
        let nodes = parse_cluster_nodes(THREE_MASTERS).unwrap();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].address, "127.0.0.1:30004");
        assert!(nodes[0].is_replica());
        assert_eq!(
            nodes[0].master_id.as_deref(),
            Some("e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca")
        );
        assert_eq!(nodes[3].slots, vec![(0, 5460)]);
        assert!(nodes[3].has_flag("myself"));
        assert_eq!(nodes[1].slot_count(), 5462);
    }

    #[test]
    fn test_parse_rejects_short_lines() {
        assert!(ClusterNode::parse("abc 127.0.0.1:7000 master").is_err());
    }

    #[test]
    fn test_all_reachable_is_healthy() {
        let nodes = parse_cluster_nodes(THREE_MASTERS).unwrap();
        let snapshot = ClusterTopologySnapshot::assess(&nodes, &HashSet::new());
        assert_eq!(snapshot.verdict, HealthVerdict::Healthy);
        assert!(snapshot.slot_coverage_complete);
        assert_eq!(snapshot.master_nodes, 3);
        assert_eq!(snapshot.replica_nodes, 1);
        let kinds: Vec<&str> = snapshot.issues.iter().map(|i| i.kind.as_str()).collect();
        assert_eq!(kinds, vec!["masters_without_replicas"]);
    }

    #[test]
    fn test_unreachable_replica_is_degraded() {
        let nodes = parse_cluster_nodes(THREE_MASTERS).unwrap();
        let down: HashSet<String> = ["127.0.0.1:30004".to_string()].into_iter().collect();
        let snapshot = ClusterTopologySnapshot::assess(&nodes, &down);
        assert_eq!(snapshot.verdict, HealthVerdict::Degraded);
        assert_eq!(snapshot.unreachable_nodes, vec!["127.0.0.1:30004".to_string()]);
        assert!(!snapshot.nodes[0].reachable);
    }

    #[test]
    fn test_three_masters_one_unreachable_is_partial_and_named() {
        let raw = "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-5460
b2 10.0.0.2:7000@17000 master - 0 0 2 connected 5461-10922
c3 10.0.0.3:7000@17000 master - 0 0 3 connected 10923-16383
";
        let nodes = parse_cluster_nodes(raw).unwrap();
        let down: HashSet<String> = ["10.0.0.2:7000".to_string()].into_iter().collect();
        let snapshot = ClusterTopologySnapshot::assess(&nodes, &down);
        assert_ne!(snapshot.verdict, HealthVerdict::Healthy);
        assert_eq!(snapshot.verdict, HealthVerdict::Partial);
        assert_eq!(snapshot.unreachable_nodes, vec!["10.0.0.2:7000".to_string()]);
        assert_eq!(snapshot.slots_covered, CLUSTER_SLOTS - 5462);
        assert!(snapshot
            .issues
            .iter()
            .any(|i| i.kind == "uncovered_slots" && i.count == 5462));
    }

    #[test]
    fn test_fail_flag_counts_as_unreachable() {
        let raw = "\
a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-16383
r1 10.0.0.9:7000@17000 slave,fail a1 0 0 1 disconnected
";
        let nodes = parse_cluster_nodes(raw).unwrap();
        let snapshot = ClusterTopologySnapshot::assess(&nodes, &HashSet::new());
        assert_eq!(snapshot.verdict, HealthVerdict::Degraded);
        assert!(snapshot.issues.iter().any(|i| i.kind == "failed_nodes"));
    }

    #[test]
    fn test_fresh_single_node_cluster_without_host_is_healthy() {
        let raw = "f0 :30001@31001 myself,master - 0 0 1 connected 0-16383\n";
        let nodes = parse_cluster_nodes(raw).unwrap();
        assert!(!nodes[0].has_address());
        assert!(nodes[0].is_self_without_host());
        let snapshot = ClusterTopologySnapshot::assess(&nodes, &HashSet::new());
        assert_eq!(snapshot.verdict, HealthVerdict::Healthy);
        assert!(snapshot.unreachable_nodes.is_empty());
        assert!(snapshot.nodes[0].reachable);
    }

    #[test]
    fn test_peer_without_host_is_still_unreachable() {
        let raw = "\
a1 10.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-16383
r1 :7001@17001 slave a1 0 0 1 connected
";
        let nodes = parse_cluster_nodes(raw).unwrap();
        let snapshot = ClusterTopologySnapshot::assess(&nodes, &HashSet::new());
        assert_eq!(snapshot.verdict, HealthVerdict::Degraded);
        assert_eq!(snapshot.unreachable_nodes, vec![":7001".to_string()]);
    }

    #[test]
    fn test_assign_host_only_fills_missing_hosts() {
        let line = "f0 :30001@31001 myself,master - 0 0 1 connected";
        let mut node = ClusterNode::parse(line).unwrap();
        node.assign_host("10.1.2.3");
        assert_eq!(node.address, "10.1.2.3:30001");
        assert!(node.has_address());
        node.assign_host("10.9.9.9");
        assert_eq!(node.address, "10.1.2.3:30001");

        let mut node = ClusterNode::parse(line).unwrap();
        node.assign_host("::1");
        assert_eq!(node.address, "[::1]:30001");
    }

    #[test]
    fn test_unreachable_masters_names_every_node() {
        let down = RedisOpsError::Connection("refused".to_string());
        let failures = vec![
            NodeFailure::new("10.0.0.1:7000", &down),
            NodeFailure::new("10.0.0.2:7000", &down),
        ];
        let err = unreachable_masters(&failures);
        assert!(err.is_connection());
        let message = err.to_string();
        assert!(message.contains("10.0.0.1:7000"), "{message}");
        assert!(message.contains("10.0.0.2:7000"), "{message}");
    }
}
