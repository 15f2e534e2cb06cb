use std::collections::VecDeque;

use crate::circuit::NodeId;

/// Disjoint-set forest with path halving
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub fn new(size: usize) -> Self {
        UnionFind {
            parent: (0..size).collect(),
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge the sets of `a` and `b`. Returns false if they were already
    /// in the same set.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        // Smaller root wins so the result does not depend on argument order
        let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[merge] = keep;
        true
    }
}

/// Partition of all nodes into super-nodes.
///
/// Each group is held together by ideal voltage constraints and contributes
/// one aggregated KCL equation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperNodes {
    groups: Vec<Vec<NodeId>>,
    membership: Vec<usize>,
}

impl SuperNodes {
    /// Partition `0..node_count` by the given links.
    ///
    /// Also returns the indices of links whose endpoints were already joined
    /// by earlier links. Each of those closes a loop of ideal constraints.
    pub fn from_links(node_count: usize, links: &[(NodeId, NodeId)]) -> (Self, Vec<usize>) {
        let mut sets = UnionFind::new(node_count);
        let mut redundant = Vec::new();
        for (index, &(a, b)) in links.iter().enumerate() {
            if !sets.union(a, b) {
                redundant.push(index);
            }
        }

        // Roots are the smallest member of each set, so iterating nodes in
        // order yields groups sorted by their first member.
        let mut membership = vec![usize::MAX; node_count];
        let mut groups: Vec<Vec<NodeId>> = Vec::new();
        let mut group_of_root = vec![usize::MAX; node_count];
        for node in 0..node_count {
            let root = sets.find(node);
            if group_of_root[root] == usize::MAX {
                group_of_root[root] = groups.len();
                groups.push(Vec::new());
            }
            let group = group_of_root[root];
            groups[group].push(node);
            membership[node] = group;
        }

        (SuperNodes { groups, membership }, redundant)
    }

    pub fn groups(&self) -> &[Vec<NodeId>] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_of(&self, node: NodeId) -> usize {
        self.membership[node]
    }

    pub fn same(&self, a: NodeId, b: NodeId) -> bool {
        self.membership[a] == self.membership[b]
    }

    /// Node each node copies its potential from: `ground` for members of
    /// the ground group, otherwise the group's lowest node
    pub fn representatives(&self, ground: NodeId) -> Vec<NodeId> {
        let ground_group = self.membership[ground];
        self.membership
            .iter()
            .map(|&group| {
                if group == ground_group {
                    ground
                } else {
                    self.groups[group][0]
                }
            })
            .collect()
    }
}

/// Nodes reachable from the head of link `cut` without crossing it.
///
/// When the links form a forest, this is the side of the cut that holds the
/// head, and the current through the cut link equals the net current leaving
/// that node set through everything else.
pub fn head_side(node_count: usize, links: &[(NodeId, NodeId)], cut: usize) -> Vec<NodeId> {
    let start = links[cut].0;
    let mut seen = vec![false; node_count];
    let mut queue = VecDeque::new();
    let mut side = Vec::new();
    seen[start] = true;
    queue.push_back(start);

    while let Some(node) = queue.pop_front() {
        side.push(node);
        for (index, &(a, b)) in links.iter().enumerate() {
            if index == cut {
                continue;
            }
            let next = if a == node {
                b
            } else if b == node {
                a
            } else {
                continue;
            };
            if !seen[next] {
                seen[next] = true;
                queue.push_back(next);
            }
        }
    }

    side.sort_unstable();
    side
}
