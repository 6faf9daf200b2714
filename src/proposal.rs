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

//! Metropolis-Hastings updates of a single tree.
//!
//! Each step picks one of four structural moves (grow, prune, change, swap),
//! builds the candidate tree, scores it against the current tree on the
//! partial residuals with the leaf means integrated out, and accepts it with
//! the usual Metropolis-Hastings probability. Moves that cannot be built on
//! the current tree are automatic rejections. The leaf means are redrawn from
//! their conjugate posterior after every structural decision.

use log::trace;
use ndarray::ArrayView1;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::DataMatrix;
use crate::error::BartError;
use crate::math::{normalized_cumsum, sample_cumulative};
use crate::ops::TreeSamplingOps;
use crate::rng::BartRng;
use crate::split_rules::{SplitRule, SplitStrategy};
use crate::tree::{DecisionTree, NodeId, TreeError, TreeMove, ROOT};

/// Structural move types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveKind {
    /// Split a leaf.
    Grow,
    /// Collapse a node with two leaf children.
    Prune,
    /// Replace the rule of a split node.
    Change,
    /// Exchange rules between a split node and a split child.
    Swap,
}

impl MoveKind {
    /// Every move kind, in the order used by [`MoveStatistics`].
    pub const ALL: [MoveKind; 4] = [
        MoveKind::Grow,
        MoveKind::Prune,
        MoveKind::Change,
        MoveKind::Swap,
    ];

    fn index(self) -> usize {
        match self {
            MoveKind::Grow => 0,
            MoveKind::Prune => 1,
            MoveKind::Change => 2,
            MoveKind::Swap => 3,
        }
    }
}

/// Prior probabilities of the move types.
///
/// A birth-or-death move is chosen with probability `birth_or_death` and is a
/// grow with probability `birth`, a prune otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveProbabilities {
    /// Probability of a grow or prune move.
    pub birth_or_death: f64,
    /// Probability that a birth-or-death move is a grow.
    pub birth: f64,
    /// Probability of a change move.
    pub change: f64,
    /// Probability of a swap move.
    pub swap: f64,
}

impl Default for MoveProbabilities {
    fn default() -> Self {
        Self {
            birth_or_death: 0.5,
            birth: 0.5,
            change: 0.4,
            swap: 0.1,
        }
    }
}

impl MoveProbabilities {
    /// Checks that the probabilities form a proper distribution.
    pub fn validate(&self) -> Result<(), BartError> {
        let all = [self.birth_or_death, self.birth, self.change, self.swap];
        if all.iter().any(|p| !p.is_finite() || *p < 0.0 || *p > 1.0) {
            return Err(BartError::InvalidConfiguration(format!(
                "move probabilities must lie in [0, 1], got {:?}",
                self
            )));
        }
        let total = self.birth_or_death + self.change + self.swap;
        if (total - 1.0).abs() > 1e-9 {
            return Err(BartError::InvalidConfiguration(format!(
                "birth-or-death, change and swap probabilities sum to {}, not 1",
                total
            )));
        }
        if self.birth_or_death == 0.0 || self.birth == 0.0 || self.birth == 1.0 {
            return Err(BartError::InvalidConfiguration(
                "both grow and prune moves must have positive probability".to_string(),
            ));
        }
        Ok(())
    }

    /// Probability of proposing `kind`.
    pub fn probability(&self, kind: MoveKind) -> f64 {
        match kind {
            MoveKind::Grow => self.birth_or_death * self.birth,
            MoveKind::Prune => self.birth_or_death * (1.0 - self.birth),
            MoveKind::Change => self.change,
            MoveKind::Swap => self.swap,
        }
    }

    /// Cumulative distribution over [`MoveKind::ALL`].
    pub fn cumulative(&self) -> Vec<f64> {
        let probs: Vec<f64> = MoveKind::ALL.iter().map(|&k| self.probability(k)).collect();
        normalized_cumsum(&probs)
    }

    /// Samples a move type.
    pub fn sample(&self, rng: &mut BartRng) -> MoveKind {
        MoveKind::ALL[sample_cumulative(&self.cumulative(), rng.uniform())]
    }
}

/// Proposal and acceptance counts per move type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveStatistics {
    proposed: [u64; 4],
    accepted: [u64; 4],
}

impl MoveStatistics {
    /// Records one proposal of `kind`.
    pub fn record(&mut self, kind: MoveKind, accepted: bool) {
        self.proposed[kind.index()] += 1;
        if accepted {
            self.accepted[kind.index()] += 1;
        }
    }

    /// Number of proposals of `kind`, infeasible ones included.
    pub fn proposed(&self, kind: MoveKind) -> u64 {
        self.proposed[kind.index()]
    }

    /// Number of accepted proposals of `kind`.
    pub fn accepted(&self, kind: MoveKind) -> u64 {
        self.accepted[kind.index()]
    }

    /// Fraction of accepted proposals of `kind`, or `None` before the first
    /// proposal.
    pub fn acceptance_rate(&self, kind: MoveKind) -> Option<f64> {
        match self.proposed(kind) {
            0 => None,
            n => Some(self.accepted(kind) as f64 / n as f64),
        }
    }
}

/// Result of one Metropolis-Hastings step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    /// Proposed move type.
    pub kind: MoveKind,
    /// Whether a candidate could be built.
    pub feasible: bool,
    /// Whether the candidate replaced the current tree.
    pub accepted: bool,
}

/// A scored candidate tree.
struct Candidate {
    tree: DecisionTree,
    mv: TreeMove,
    log_ratio: f64,
}

/// Proposes, scores and accepts structural moves for one tree at a time.
pub struct ProposalEngine<'a> {
    ops: &'a TreeSamplingOps,
    moves: &'a MoveProbabilities,
    data: &'a DataMatrix,
}

impl<'a> ProposalEngine<'a> {
    /// Creates an engine over the current data.
    pub fn new(ops: &'a TreeSamplingOps, moves: &'a MoveProbabilities, data: &'a DataMatrix) -> Self {
        Self { ops, moves, data }
    }

    /// Runs one Metropolis-Hastings step on `tree` against `residuals`, then
    /// redraws every leaf mean.
    ///
    /// With `allow_empty` unset an empty leaf at draw time is reported as
    /// [`TreeError::EmptyLeaf`].
    pub fn step(
        &self,
        tree: &mut DecisionTree,
        residuals: ArrayView1<f64>,
        sigma2: f64,
        rng: &mut BartRng,
        stats: &mut MoveStatistics,
        allow_empty: bool,
    ) -> Result<StepOutcome, TreeError> {
        let kind = self.moves.sample(rng);
        let candidate = self.propose(kind, tree, residuals, sigma2, rng)?;

        let outcome = match candidate {
            Some(candidate) => {
                let u = rng.uniform();
                let accepted = u.ln() < candidate.log_ratio;
                trace!(
                    "{:?} move {:?}: log ratio {:.4}, accepted {}",
                    kind,
                    candidate.mv,
                    candidate.log_ratio,
                    accepted
                );
                if accepted {
                    *tree = candidate.tree;
                }
                StepOutcome {
                    kind,
                    feasible: true,
                    accepted,
                }
            }
            None => {
                trace!("{:?} move infeasible", kind);
                StepOutcome {
                    kind,
                    feasible: false,
                    accepted: false,
                }
            }
        };
        stats.record(kind, outcome.accepted);

        self.draw_leaf_values(tree, residuals, sigma2, rng, allow_empty)?;
        Ok(outcome)
    }

    fn propose(
        &self,
        kind: MoveKind,
        tree: &DecisionTree,
        residuals: ArrayView1<f64>,
        sigma2: f64,
        rng: &mut BartRng,
    ) -> Result<Option<Candidate>, TreeError> {
        match kind {
            MoveKind::Grow => self.propose_grow(tree, residuals, sigma2, rng),
            MoveKind::Prune => self.propose_prune(tree, residuals, sigma2, rng),
            MoveKind::Change => self.propose_change(tree, residuals, sigma2, rng),
            MoveKind::Swap => self.propose_swap(tree, residuals, sigma2, rng),
        }
    }

    fn propose_grow(
        &self,
        tree: &DecisionTree,
        residuals: ArrayView1<f64>,
        sigma2: f64,
        rng: &mut BartRng,
    ) -> Result<Option<Candidate>, TreeError> {
        let growable = self.growable_leaves(tree);
        if growable.is_empty() {
            return Ok(None);
        }
        let leaf = growable[rng.gen_range(0..growable.len())];
        let Some(rule) = self.sample_rule(tree, leaf, rng) else {
            return Ok(None);
        };

        let mv = TreeMove::Grow { leaf, rule };
        let mut candidate = tree.clone();
        candidate.apply(&mv, self.data.x())?;

        let n_prunable = candidate.prunable_nodes().len();
        let log_ratio = self.subtree_log_likelihood(&candidate, leaf, residuals, sigma2)
            - self.subtree_log_likelihood(tree, leaf, residuals, sigma2)
            + self.log_structure_prior(&candidate, leaf)
            - self.log_structure_prior(tree, leaf)
            + self.moves.probability(MoveKind::Prune).ln()
            - (n_prunable as f64).ln()
            - self.moves.probability(MoveKind::Grow).ln()
            + (growable.len() as f64).ln();

        Ok(Some(Candidate {
            tree: candidate,
            mv,
            log_ratio,
        }))
    }

    fn propose_prune(
        &self,
        tree: &DecisionTree,
        residuals: ArrayView1<f64>,
        sigma2: f64,
        rng: &mut BartRng,
    ) -> Result<Option<Candidate>, TreeError> {
        let prunable = tree.prunable_nodes();
        if prunable.is_empty() {
            return Ok(None);
        }
        let node = prunable[rng.gen_range(0..prunable.len())];

        let mv = TreeMove::Prune { node };
        let mut candidate = tree.clone();
        candidate.apply(&mv, self.data.x())?;

        // The reverse grow must be able to split the collapsed node.
        let n_growable = self.growable_leaves(&candidate).len();
        if n_growable == 0 {
            return Ok(None);
        }

        let log_ratio = self.subtree_log_likelihood(&candidate, node, residuals, sigma2)
            - self.subtree_log_likelihood(tree, node, residuals, sigma2)
            + self.log_structure_prior(&candidate, node)
            - self.log_structure_prior(tree, node)
            + self.moves.probability(MoveKind::Grow).ln()
            - (n_growable as f64).ln()
            - self.moves.probability(MoveKind::Prune).ln()
            + (prunable.len() as f64).ln();

        Ok(Some(Candidate {
            tree: candidate,
            mv,
            log_ratio,
        }))
    }

    fn propose_change(
        &self,
        tree: &DecisionTree,
        residuals: ArrayView1<f64>,
        sigma2: f64,
        rng: &mut BartRng,
    ) -> Result<Option<Candidate>, TreeError> {
        let internal = tree.internal_nodes();
        if internal.is_empty() {
            return Ok(None);
        }
        let node = internal[rng.gen_range(0..internal.len())];
        let Some(&old_rule) = tree.rule(node) else {
            return Ok(None);
        };
        let Some(rule) = self.sample_rule(tree, node, rng) else {
            return Ok(None);
        };

        let mv = TreeMove::Change { node, rule };
        let mut candidate = tree.clone();
        candidate.apply(&mv, self.data.x())?;
        if has_empty_leaf_under(&candidate, node) {
            return Ok(None);
        }

        let log_ratio = self.subtree_log_likelihood(&candidate, node, residuals, sigma2)
            - self.subtree_log_likelihood(tree, node, residuals, sigma2)
            + self.log_structure_prior(&candidate, node)
            - self.log_structure_prior(tree, node)
            + self.log_rule_prior(&candidate, node)
            - self.log_rule_prior(tree, node)
            + self.log_rule_probability(&candidate, node, &old_rule)
            - self.log_rule_probability(tree, node, &rule);

        Ok(Some(Candidate {
            tree: candidate,
            mv,
            log_ratio,
        }))
    }

    fn propose_swap(
        &self,
        tree: &DecisionTree,
        residuals: ArrayView1<f64>,
        sigma2: f64,
        rng: &mut BartRng,
    ) -> Result<Option<Candidate>, TreeError> {
        let pairs = swappable_pairs(tree);
        if pairs.is_empty() {
            return Ok(None);
        }
        let (parent, child) = pairs[rng.gen_range(0..pairs.len())];

        let mv = TreeMove::Swap { parent, child };
        let mut candidate = tree.clone();
        candidate.apply(&mv, self.data.x())?;
        if has_empty_leaf_under(&candidate, parent) {
            return Ok(None);
        }

        let log_ratio = self.subtree_log_likelihood(&candidate, parent, residuals, sigma2)
            - self.subtree_log_likelihood(tree, parent, residuals, sigma2)
            + self.log_structure_prior(&candidate, parent)
            - self.log_structure_prior(tree, parent)
            + self.log_rule_prior(&candidate, parent)
            - self.log_rule_prior(tree, parent);

        Ok(Some(Candidate {
            tree: candidate,
            mv,
            log_ratio,
        }))
    }

    /// Draws every leaf mean of `tree` from its conjugate posterior.
    ///
    /// Empty leaves receive a prior draw when `allow_empty` is set and raise
    /// [`TreeError::EmptyLeaf`] otherwise.
    pub fn draw_leaf_values(
        &self,
        tree: &mut DecisionTree,
        residuals: ArrayView1<f64>,
        sigma2: f64,
        rng: &mut BartRng,
        allow_empty: bool,
    ) -> Result<(), TreeError> {
        for leaf in tree.leaves() {
            let (n, sum) = leaf_sufficient_stats(tree, leaf, residuals);
            if n == 0 && !allow_empty {
                return Err(TreeError::EmptyLeaf(leaf));
            }
            let value = self.ops.sample_leaf_value(n, sum, sigma2, rng);
            tree.set_leaf_value(leaf, value)?;
        }
        Ok(())
    }

    /// Grows a tree from the structure prior, starting from a stump over every
    /// training observation, and draws its leaf means from their prior.
    pub fn draw_from_prior(&self, rng: &mut BartRng) -> Result<DecisionTree, TreeError> {
        let mut tree = DecisionTree::new(0.0, self.data.n_obs());
        let mut pending = vec![ROOT];
        while let Some(leaf) = pending.pop() {
            let depth = tree.node_depth(leaf);
            if !self.ops.sample_expand_flag(depth, rng) {
                continue;
            }
            if let Some(rule) = self.sample_rule(&tree, leaf, rng) {
                let (left, right) = tree.split_leaf(leaf, rule, self.data.x())?;
                pending.push(right);
                pending.push(left);
            }
        }
        for leaf in tree.leaves() {
            let value = self.ops.sample_prior_leaf_value(rng);
            tree.set_leaf_value(leaf, value)?;
        }
        Ok(tree)
    }

    fn node_values(&self, tree: &DecisionTree, node: NodeId, variable: usize) -> Vec<f64> {
        let x = self.data.x();
        tree.observations(node)
            .iter()
            .map(|&i| x[[i, variable]])
            .collect()
    }

    fn count_rules(&self, tree: &DecisionTree, node: NodeId, variable: usize) -> u64 {
        let values = self.node_values(tree, node, variable);
        self.data.predictor(variable).strategy().count_rules(&values)
    }

    /// Variables with at least one valid rule at `node`.
    pub fn available_variables(&self, tree: &DecisionTree, node: NodeId) -> Vec<usize> {
        (0..self.data.n_vars())
            .filter(|&variable| self.count_rules(tree, node, variable) > 0)
            .collect()
    }

    /// Whether some rule divides the observations of `leaf` into two
    /// non-empty groups.
    pub fn is_growable(&self, tree: &DecisionTree, leaf: NodeId) -> bool {
        tree.observations(leaf).len() >= 2
            && (0..self.data.n_vars()).any(|variable| self.count_rules(tree, leaf, variable) > 0)
    }

    fn growable_leaves(&self, tree: &DecisionTree) -> Vec<NodeId> {
        tree.leaves()
            .into_iter()
            .filter(|&leaf| self.is_growable(tree, leaf))
            .collect()
    }

    /// Samples a valid rule at `node`: a variable uniformly among the
    /// available ones, then a rule uniformly among that variable's valid rules.
    pub fn sample_rule(&self, tree: &DecisionTree, node: NodeId, rng: &mut BartRng) -> Option<SplitRule> {
        let available = self.available_variables(tree, node);
        if available.is_empty() {
            return None;
        }
        let variable = available[rng.gen_range(0..available.len())];
        let values = self.node_values(tree, node, variable);
        self.data
            .predictor(variable)
            .strategy()
            .sample_rule(variable, &values, rng)
    }

    /// Log probability that [`ProposalEngine::sample_rule`] draws `rule` at
    /// `node`. Zero when no rule is available there.
    pub fn log_rule_probability(&self, tree: &DecisionTree, node: NodeId, rule: &SplitRule) -> f64 {
        let n_available = self.available_variables(tree, node).len();
        let n_rules = self.count_rules(tree, node, rule.variable());
        if n_available == 0 || n_rules == 0 {
            return 0.0;
        }
        -(n_available as f64).ln() - (n_rules as f64).ln()
    }

    fn log_rule_prior(&self, tree: &DecisionTree, node: NodeId) -> f64 {
        tree.subtree(node)
            .into_iter()
            .filter_map(|id| tree.rule(id).map(|rule| self.log_rule_probability(tree, id, rule)))
            .sum()
    }

    /// Depth-penalty log prior of the subtree at `node`. A leaf without any
    /// valid rule stays a leaf with probability one.
    fn log_structure_prior(&self, tree: &DecisionTree, node: NodeId) -> f64 {
        tree.subtree(node)
            .into_iter()
            .map(|id| {
                let depth = tree.node_depth(id);
                if !tree.is_leaf(id) {
                    self.ops.log_split_prior(depth)
                } else if self.is_growable(tree, id) {
                    self.ops.log_leaf_prior(depth)
                } else {
                    0.0
                }
            })
            .sum()
    }

    fn subtree_log_likelihood(
        &self,
        tree: &DecisionTree,
        node: NodeId,
        residuals: ArrayView1<f64>,
        sigma2: f64,
    ) -> f64 {
        tree.leaves_under(node)
            .into_iter()
            .map(|leaf| {
                let (n, sum) = leaf_sufficient_stats(tree, leaf, residuals);
                self.ops.leaf_log_likelihood(n, sum, sigma2)
            })
            .sum()
    }
}

fn leaf_sufficient_stats(tree: &DecisionTree, leaf: NodeId, residuals: ArrayView1<f64>) -> (usize, f64) {
    let observations = tree.observations(leaf);
    let sum = observations.iter().map(|&i| residuals[i]).sum();
    (observations.len(), sum)
}

fn has_empty_leaf_under(tree: &DecisionTree, node: NodeId) -> bool {
    tree.leaves_under(node)
        .into_iter()
        .any(|leaf| tree.observations(leaf).is_empty())
}

/// Pairs of split nodes and their split children.
fn swappable_pairs(tree: &DecisionTree) -> Vec<(NodeId, NodeId)> {
    let mut pairs = Vec::new();
    for parent in tree.internal_nodes() {
        for child in [tree.left_child(parent), tree.right_child(parent)]
            .into_iter()
            .flatten()
        {
            if !tree.is_leaf(child) {
                pairs.push((parent, child));
            }
        }
    }
    pairs
}
