//   Copyright 2024 The PyMC Developers
//
//   Licensed under the Apache License, Version 2.0 (the "License");
//   you may not use this file except in compliance with the License.
//   You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
//   Unless required by applicable law or agreed to in writing, software
//   distributed under the License is distributed on an "AS IS" BASIS,
//   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//   See the License for the specific language governing permissions and
//   limitations under the License.

//! A Binary Decision Tree is the core data structure for Bayesian Additive
//! Regression Trees (BART). The tree is implemented as an arena: nodes live in
//! a vector and refer to their parent and children by index.
//!
//! Index links keep structural moves (grow, prune, change, swap) cheap and
//! free of borrow checker issues related to classical recursive binary tree
//! implementations, and make cloning a tree a plain vector copy. Slots freed
//! by prune moves are recycled through a free list.
//!
//! Every node caches the training observations routed to it. The cache is the
//! basis of the likelihood computations and of the no-empty-leaf checks, and
//! it is not serialized: [`DecisionTree::reroute_all`] rebuilds it.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::split_rules::{divide, SplitRule};

/// Arena index of a node.
pub type NodeId = usize;

/// Index of the root node.
pub const ROOT: NodeId = 0;

/// Represents errors related to binary decision tree operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// When attempting to split a leaf node, if the node is not a leaf.
    #[error("cannot split non-leaf node {0}")]
    NonLeafSplit(NodeId),
    /// The index does not refer to a live node.
    #[error("node index {0} does not exist")]
    InvalidNodeIndex(NodeId),
    /// The node is not an internal node.
    #[error("node {0} is not an internal node")]
    NotInternal(NodeId),
    /// Only internal nodes whose children are both leaves can be pruned.
    #[error("node {0} does not have two leaf children")]
    NotPrunable(NodeId),
    /// The nodes of a swap are not parent and child.
    #[error("node {child} is not a child of node {parent}")]
    NotParentChild {
        /// Expected parent.
        parent: NodeId,
        /// Expected child.
        child: NodeId,
    },
    /// A leaf has no training observations.
    #[error("leaf {0} has no training observations")]
    EmptyLeaf(NodeId),
}

/// Content of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Terminal node holding a mean parameter.
    Leaf {
        /// Leaf mean.
        value: f64,
    },
    /// Split node.
    Internal {
        /// Split rule.
        rule: SplitRule,
        /// Child receiving observations for which the rule holds.
        left: NodeId,
        /// Child receiving the remaining observations.
        right: NodeId,
    },
}

/// A node of the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Parent index; `None` for the root.
    pub parent: Option<NodeId>,
    /// Leaf or split content.
    pub kind: NodeKind,
    #[serde(skip)]
    observations: Vec<usize>,
}

impl Node {
    fn leaf(parent: Option<NodeId>, value: f64, observations: Vec<usize>) -> Self {
        Self {
            parent,
            kind: NodeKind::Leaf { value },
            observations,
        }
    }

    fn vacant() -> Self {
        Self::leaf(None, 0.0, Vec::new())
    }

    /// Whether the node is a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }
}

/// Structural moves understood by [`DecisionTree::apply`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TreeMove {
    /// Split `leaf` with `rule`.
    Grow {
        /// Leaf to split.
        leaf: NodeId,
        /// New rule.
        rule: SplitRule,
    },
    /// Collapse `node`, whose children are leaves, into a leaf.
    Prune {
        /// Node to collapse.
        node: NodeId,
    },
    /// Replace the rule of internal node `node`.
    Change {
        /// Internal node.
        node: NodeId,
        /// Replacement rule.
        rule: SplitRule,
    },
    /// Exchange the rules of `parent` and its internal child `child`.
    Swap {
        /// Internal node.
        parent: NodeId,
        /// Internal child of `parent`.
        child: NodeId,
    },
}

/// A `DecisionTree` is an arena-based implementation of the binary decision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
}

impl DecisionTree {
    /// Creates a stump: a root leaf holding `value` and every one of the
    /// `n_obs` training observations.
    pub fn new(value: f64, n_obs: usize) -> Self {
        Self {
            nodes: vec![Node::leaf(None, value, (0..n_obs).collect())],
            free: Vec::new(),
        }
    }

    /// Node `id`. Panics if `id` is outside the arena.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Number of live nodes.
    pub fn n_nodes(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Checks whether `id` refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        id < self.nodes.len() && !self.free.contains(&id)
    }

    /// Checks whether the passed index is a leaf node.
    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].is_leaf()
    }

    /// Left child of _this_ node, if it is a split node.
    pub fn left_child(&self, id: NodeId) -> Option<NodeId> {
        match self.nodes[id].kind {
            NodeKind::Internal { left, .. } => Some(left),
            NodeKind::Leaf { .. } => None,
        }
    }

    /// Right child of _this_ node, if it is a split node.
    pub fn right_child(&self, id: NodeId) -> Option<NodeId> {
        match self.nodes[id].kind {
            NodeKind::Internal { right, .. } => Some(right),
            NodeKind::Leaf { .. } => None,
        }
    }

    /// Parent of _this_ node.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// Split rule of _this_ node, if it is a split node.
    pub fn rule(&self, id: NodeId) -> Option<&SplitRule> {
        match &self.nodes[id].kind {
            NodeKind::Internal { rule, .. } => Some(rule),
            NodeKind::Leaf { .. } => None,
        }
    }

    /// Mean parameter of _this_ node, if it is a leaf.
    pub fn leaf_value(&self, id: NodeId) -> Option<f64> {
        match self.nodes[id].kind {
            NodeKind::Leaf { value } => Some(value),
            NodeKind::Internal { .. } => None,
        }
    }

    /// Sets the mean parameter of leaf `id`.
    pub fn set_leaf_value(&mut self, id: NodeId, value: f64) -> Result<(), TreeError> {
        match &mut self.nodes[id].kind {
            NodeKind::Leaf { value: current } => {
                *current = value;
                Ok(())
            }
            NodeKind::Internal { .. } => Err(TreeError::NonLeafSplit(id)),
        }
    }

    /// Training observations routed to _this_ node, in ascending order.
    pub fn observations(&self, id: NodeId) -> &[usize] {
        &self.nodes[id].observations
    }

    /// Computes the depth of _this_ node in the `DecisionTree`.
    #[inline]
    pub fn node_depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Depth of the deepest leaf.
    pub fn max_depth(&self) -> usize {
        self.leaves()
            .into_iter()
            .map(|leaf| self.node_depth(leaf))
            .max()
            .unwrap_or(0)
    }

    /// Nodes of the subtree rooted at `id`, in pre-order with left children
    /// first.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            order.push(current);
            if let NodeKind::Internal { left, right, .. } = self.nodes[current].kind {
                stack.push(right);
                stack.push(left);
            }
        }
        order
    }

    /// Leaves of the subtree rooted at `id`, left to right.
    pub fn leaves_under(&self, id: NodeId) -> Vec<NodeId> {
        self.subtree(id)
            .into_iter()
            .filter(|&node| self.is_leaf(node))
            .collect()
    }

    /// Leaves of the tree, left to right.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.leaves_under(ROOT)
    }

    /// Number of leaves.
    pub fn count_leaves(&self) -> usize {
        self.leaves().len()
    }

    /// Split nodes in pre-order.
    pub fn internal_nodes(&self) -> Vec<NodeId> {
        self.subtree(ROOT)
            .into_iter()
            .filter(|&node| !self.is_leaf(node))
            .collect()
    }

    /// Split nodes whose two children are leaves.
    pub fn prunable_nodes(&self) -> Vec<NodeId> {
        self.internal_nodes()
            .into_iter()
            .filter(|&node| self.is_prunable(node))
            .collect()
    }

    fn is_prunable(&self, id: NodeId) -> bool {
        match self.nodes[id].kind {
            NodeKind::Internal { left, right, .. } => self.is_leaf(left) && self.is_leaf(right),
            NodeKind::Leaf { .. } => false,
        }
    }

    /// Leaf reached by an observation whose predictor values are `x`.
    pub fn leaf_containing(&self, x: ArrayView1<f64>) -> NodeId {
        let mut node = ROOT;
        while let NodeKind::Internal { rule, left, right } = &self.nodes[node].kind {
            node = if rule.goes_left(x[rule.variable()]) {
                *left
            } else {
                *right
            };
        }
        node
    }

    /// Evaluates the tree for an observation whose predictor values are `x`.
    pub fn evaluate(&self, x: ArrayView1<f64>) -> f64 {
        match self.nodes[self.leaf_containing(x)].kind {
            NodeKind::Leaf { value } => value,
            NodeKind::Internal { .. } => unreachable!("leaf_containing returns a leaf"),
        }
    }

    /// Evaluates the tree for every row of `x`.
    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        x.outer_iter().map(|row| self.evaluate(row)).collect()
    }

    /// Writes the leaf value of every training observation into `out`.
    pub fn fill_train_fit(&self, out: &mut Array1<f64>) {
        for leaf in self.leaves() {
            if let NodeKind::Leaf { value } = self.nodes[leaf].kind {
                for &i in &self.nodes[leaf].observations {
                    out[i] = value;
                }
            }
        }
    }

    /// Training observations of every leaf, left to right.
    pub fn partition(&self) -> Vec<Vec<usize>> {
        self.leaves()
            .into_iter()
            .map(|leaf| self.nodes[leaf].observations.clone())
            .collect()
    }

    /// Leaves without training observations.
    pub fn empty_leaves(&self) -> Vec<NodeId> {
        self.leaves()
            .into_iter()
            .filter(|&leaf| self.nodes[leaf].observations.is_empty())
            .collect()
    }

    /// Whether some leaf has no training observations.
    pub fn has_empty_leaf(&self) -> bool {
        self.leaves()
            .into_iter()
            .any(|leaf| self.nodes[leaf].observations.is_empty())
    }

    /// Whether some split node uses `variable`.
    pub fn splits_on(&self, variable: usize) -> bool {
        self.internal_nodes()
            .into_iter()
            .any(|node| self.rule(node).map(SplitRule::variable) == Some(variable))
    }

    /// Adds the number of splits on each variable to `counts`.
    pub fn split_counts(&self, counts: &mut [u32]) {
        for node in self.internal_nodes() {
            if let Some(rule) = self.rule(node) {
                counts[rule.variable()] += 1;
            }
        }
    }

    fn check_node(&self, id: NodeId) -> Result<(), TreeError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(TreeError::InvalidNodeIndex(id))
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release_subtree(&mut self, id: NodeId) {
        for node in self.subtree(id) {
            self.nodes[node] = Node::vacant();
            self.free.push(node);
        }
    }

    /// Splits a leaf node into an internal node with two new leaves. Both
    /// children start with the value of the split leaf.
    pub fn split_leaf(
        &mut self,
        leaf: NodeId,
        rule: SplitRule,
        x: &Array2<f64>,
    ) -> Result<(NodeId, NodeId), TreeError> {
        self.check_node(leaf)?;
        let value = self.leaf_value(leaf).ok_or(TreeError::NonLeafSplit(leaf))?;

        let (left_obs, right_obs) = divide(&rule, x, &self.nodes[leaf].observations);
        let left = self.alloc(Node::leaf(Some(leaf), value, left_obs));
        let right = self.alloc(Node::leaf(Some(leaf), value, right_obs));
        self.nodes[leaf].kind = NodeKind::Internal { rule, left, right };

        Ok((left, right))
    }

    /// Collapses a split node whose children are leaves back into a leaf. The
    /// new leaf holds the observation-weighted mean of the children values.
    pub fn prune(&mut self, node: NodeId) -> Result<(), TreeError> {
        self.check_node(node)?;
        if !self.is_prunable(node) {
            return Err(TreeError::NotPrunable(node));
        }
        let (left, right) = match self.nodes[node].kind {
            NodeKind::Internal { left, right, .. } => (left, right),
            NodeKind::Leaf { .. } => return Err(TreeError::NotPrunable(node)),
        };

        let weight = |id: NodeId| self.nodes[id].observations.len() as f64;
        let (n_left, n_right) = (weight(left), weight(right));
        let (v_left, v_right) = (
            self.leaf_value(left).unwrap_or(0.0),
            self.leaf_value(right).unwrap_or(0.0),
        );
        let value = if n_left + n_right > 0.0 {
            (n_left * v_left + n_right * v_right) / (n_left + n_right)
        } else {
            0.5 * (v_left + v_right)
        };

        self.release_subtree(left);
        self.release_subtree(right);
        self.nodes[node].kind = NodeKind::Leaf { value };
        Ok(())
    }

    /// Replaces the rule of a split node and re-routes its subtree.
    pub fn change_rule(
        &mut self,
        node: NodeId,
        rule: SplitRule,
        x: &Array2<f64>,
    ) -> Result<(), TreeError> {
        self.check_node(node)?;
        self.set_rule(node, rule)?;
        self.reroute(node, x);
        Ok(())
    }

    /// Exchanges the rules of `parent` and its split child `child`, then
    /// re-routes the subtree. When the other child carries the same rule as
    /// `child`, it receives the parent rule as well.
    pub fn swap_with_child(
        &mut self,
        parent: NodeId,
        child: NodeId,
        x: &Array2<f64>,
    ) -> Result<(), TreeError> {
        self.check_node(parent)?;
        self.check_node(child)?;
        let (parent_rule, left, right) = match self.nodes[parent].kind {
            NodeKind::Internal { rule, left, right } => (rule, left, right),
            NodeKind::Leaf { .. } => return Err(TreeError::NotInternal(parent)),
        };
        if child != left && child != right {
            return Err(TreeError::NotParentChild { parent, child });
        }
        let child_rule = *self.rule(child).ok_or(TreeError::NotInternal(child))?;
        let sibling = if child == left { right } else { left };

        if self.rule(sibling) == Some(&child_rule) {
            self.set_rule(sibling, parent_rule)?;
        }
        self.set_rule(child, parent_rule)?;
        self.set_rule(parent, child_rule)?;
        self.reroute(parent, x);
        Ok(())
    }

    /// Applies a structural move in place.
    pub fn apply(&mut self, mv: &TreeMove, x: &Array2<f64>) -> Result<(), TreeError> {
        match *mv {
            TreeMove::Grow { leaf, rule } => self.split_leaf(leaf, rule, x).map(|_| ()),
            TreeMove::Prune { node } => self.prune(node),
            TreeMove::Change { node, rule } => self.change_rule(node, rule, x),
            TreeMove::Swap { parent, child } => self.swap_with_child(parent, child, x),
        }
    }

    fn set_rule(&mut self, id: NodeId, new_rule: SplitRule) -> Result<(), TreeError> {
        match &mut self.nodes[id].kind {
            NodeKind::Internal { rule, .. } => {
                *rule = new_rule;
                Ok(())
            }
            NodeKind::Leaf { .. } => Err(TreeError::NotInternal(id)),
        }
    }

    /// Re-partitions the cached observations of the subtree rooted at `id`
    /// according to the current rules and predictor values.
    pub fn reroute(&mut self, id: NodeId, x: &Array2<f64>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let NodeKind::Internal { rule, left, right } = self.nodes[current].kind {
                let (left_obs, right_obs) = divide(&rule, x, &self.nodes[current].observations);
                self.nodes[left].observations = left_obs;
                self.nodes[right].observations = right_obs;
                stack.push(right);
                stack.push(left);
            }
        }
    }

    /// Routes every row of `x` from the root.
    pub fn reroute_all(&mut self, x: &Array2<f64>) {
        self.nodes[ROOT].observations = (0..x.nrows()).collect();
        self.reroute(ROOT, x);
    }

    /// Removes every split that has a side without training observations by
    /// hoisting the non-empty child into the split's place. Returns the number
    /// of splits removed.
    pub fn coalesce_empty_splits(&mut self) -> usize {
        let mut removed = 0;
        let mut stack = vec![ROOT];
        while let Some(node) = stack.pop() {
            let (left, right) = match self.nodes[node].kind {
                NodeKind::Internal { left, right, .. } => (left, right),
                NodeKind::Leaf { .. } => continue,
            };
            let left_empty = self.nodes[left].observations.is_empty();
            let right_empty = self.nodes[right].observations.is_empty();
            if left_empty || right_empty {
                let (keep, drop) = if left_empty {
                    (right, left)
                } else {
                    (left, right)
                };
                self.release_subtree(drop);
                self.hoist(node, keep);
                removed += 1;
                stack.push(node);
            } else {
                stack.push(right);
                stack.push(left);
            }
        }
        removed
    }

    fn hoist(&mut self, node: NodeId, keep: NodeId) {
        let kept = std::mem::replace(&mut self.nodes[keep], Node::vacant());
        self.free.push(keep);
        if let NodeKind::Internal { left, right, .. } = kept.kind {
            self.nodes[left].parent = Some(node);
            self.nodes[right].parent = Some(node);
        }
        self.nodes[node].kind = kept.kind;
        self.nodes[node].observations = kept.observations;
    }
}
