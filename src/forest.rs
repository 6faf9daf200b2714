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

//! The ensemble of trees and its Bayesian backfitting sweep.
//!
//! A `Forest` keeps, for every tree, its fitted values on the train and test
//! sets, together with the running totals over all trees. The totals are
//! updated incrementally after each tree update so that the partial residuals
//! of the next tree are available without re-evaluating the ensemble.

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

use crate::data::DataMatrix;
use crate::error::BartError;
use crate::proposal::{MoveStatistics, ProposalEngine};
use crate::rng::BartRng;
use crate::tree::{DecisionTree, NodeId, TreeError};

/// Sum-of-trees model with cached per-tree fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forest {
    trees: Vec<DecisionTree>,
    train_fits: Vec<Array1<f64>>,
    test_fits: Vec<Array1<f64>>,
    predictions: Array1<f64>,
    test_predictions: Array1<f64>,
}

impl Forest {
    /// Builds the ensemble and evaluates every tree on `data`. The trees'
    /// observation caches must already reflect `data`.
    pub fn new(trees: Vec<DecisionTree>, data: &DataMatrix) -> Self {
        let n = data.n_obs();
        let n_test = data.n_test();
        let mut forest = Self {
            train_fits: vec![Array1::zeros(n); trees.len()],
            test_fits: vec![Array1::zeros(n_test); trees.len()],
            trees,
            predictions: Array1::zeros(n),
            test_predictions: Array1::zeros(n_test),
        };
        for j in 0..forest.trees.len() {
            forest.refit(j, data.x_test());
        }
        forest
    }

    /// Number of trees.
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Trees in sweep order.
    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }

    /// Tree `j`.
    pub fn tree(&self, j: usize) -> &DecisionTree {
        &self.trees[j]
    }

    /// Training fit of tree `j`.
    pub fn train_fit(&self, j: usize) -> &Array1<f64> {
        &self.train_fits[j]
    }

    /// Test fit of tree `j`.
    pub fn test_fit(&self, j: usize) -> &Array1<f64> {
        &self.test_fits[j]
    }

    /// Sum of the tree fits on the training set, without offset.
    pub fn predictions(&self) -> &Array1<f64> {
        &self.predictions
    }

    /// Sum of the tree fits on the test set, without offset.
    pub fn test_predictions(&self) -> &Array1<f64> {
        &self.test_predictions
    }

    /// Updates every tree once, in index order, against the partial residuals
    /// `target - (predictions - fit_j)`.
    ///
    /// An empty leaf found while `allow_empty` is unset is an invariant breach.
    pub fn sweep(
        &mut self,
        engine: &ProposalEngine<'_>,
        data: &DataMatrix,
        target: ArrayView1<f64>,
        sigma2: f64,
        rng: &mut BartRng,
        stats: &mut MoveStatistics,
        allow_empty: bool,
    ) -> Result<(), BartError> {
        let mut residuals = Array1::zeros(target.len());
        for j in 0..self.trees.len() {
            Zip::from(&mut residuals)
                .and(&target)
                .and(&self.predictions)
                .and(&self.train_fits[j])
                .for_each(|r, &t, &total, &fit| *r = t - (total - fit));

            engine
                .step(
                    &mut self.trees[j],
                    residuals.view(),
                    sigma2,
                    rng,
                    stats,
                    allow_empty,
                )
                .map_err(|err| match err {
                    TreeError::EmptyLeaf(node) => BartError::InvariantBreach { tree: j, node },
                    other => BartError::Tree(other),
                })?;

            self.refit(j, data.x_test());
        }
        Ok(())
    }

    /// Installs `tree` at position `j`, routing it over the training data.
    pub fn replace_tree(&mut self, j: usize, mut tree: DecisionTree, data: &DataMatrix) {
        tree.reroute_all(data.x());
        self.install(j, tree, data.x_test());
    }

    /// Installs an already routed tree at position `j`.
    pub(crate) fn install(&mut self, j: usize, tree: DecisionTree, x_test: &Array2<f64>) {
        self.trees[j] = tree;
        self.refit(j, x_test);
    }

    /// Rebuilds the observation caches of every tree from `x`.
    pub fn reroute_all(&mut self, x: &Array2<f64>) {
        for tree in self.trees.iter_mut() {
            tree.reroute_all(x);
        }
    }

    /// Re-evaluates every tree on the test set and recomputes the test totals.
    pub fn refresh_test(&mut self, x_test: &Array2<f64>) {
        self.test_predictions = Array1::zeros(x_test.nrows());
        for (tree, fit) in self.trees.iter().zip(self.test_fits.iter_mut()) {
            *fit = tree.predict(x_test);
            self.test_predictions += &*fit;
        }
    }

    /// Re-evaluates every tree on the training set and recomputes the
    /// training totals.
    pub fn refresh_train(&mut self) {
        if let Some(first) = self.train_fits.first() {
            self.predictions = Array1::zeros(first.len());
        }
        for (tree, fit) in self.trees.iter().zip(self.train_fits.iter_mut()) {
            tree.fill_train_fit(fit);
            self.predictions += &*fit;
        }
    }

    /// Coalesces the empty splits of every tree. Returns the number of splits
    /// removed.
    pub fn coalesce_empty_splits(&mut self, x_test: &Array2<f64>) -> usize {
        let mut removed = 0;
        for j in 0..self.trees.len() {
            let n = self.trees[j].coalesce_empty_splits();
            if n > 0 {
                debug!("coalesced {} empty splits in tree {}", n, j);
                self.refit(j, x_test);
                removed += n;
            }
        }
        removed
    }

    /// First empty leaf found, as `(tree, node)`.
    pub fn empty_leaf(&self) -> Option<(usize, NodeId)> {
        self.trees
            .iter()
            .enumerate()
            .find_map(|(j, tree)| tree.empty_leaves().first().map(|&node| (j, node)))
    }

    /// Largest absolute deviation between the running totals and the sum of
    /// the per-tree fits, over the train and test sets.
    pub fn aggregation_error(&self) -> f64 {
        fn deviation(fits: &[Array1<f64>], total: &Array1<f64>) -> f64 {
            let mut sum = Array1::<f64>::zeros(total.len());
            for fit in fits {
                sum += fit;
            }
            sum.iter()
                .zip(total.iter())
                .fold(0.0, |acc, (a, b)| acc.max((a - b).abs()))
        }
        deviation(&self.train_fits, &self.predictions)
            .max(deviation(&self.test_fits, &self.test_predictions))
    }

    /// Number of splits on each of the `n_vars` variables across the ensemble.
    pub fn variable_counts(&self, n_vars: usize) -> Vec<u32> {
        let mut counts = vec![0; n_vars];
        for tree in &self.trees {
            tree.split_counts(&mut counts);
        }
        counts
    }

    fn refit(&mut self, j: usize, x_test: &Array2<f64>) {
        let tree = &self.trees[j];

        let mut train_fit = Array1::zeros(self.predictions.len());
        tree.fill_train_fit(&mut train_fit);
        Zip::from(&mut self.predictions)
            .and(&train_fit)
            .and(&self.train_fits[j])
            .for_each(|total, &new, &old| *total += new - old);
        self.train_fits[j] = train_fit;

        let test_fit = tree.predict(x_test);
        Zip::from(&mut self.test_predictions)
            .and(&test_fit)
            .and(&self.test_fits[j])
            .for_each(|total, &new, &old| *total += new - old);
        self.test_fits[j] = test_fit;
    }
}
