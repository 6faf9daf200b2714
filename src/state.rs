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

//! A single BART chain.
//!
//! `BartState` is the main entry point of the sampler. It owns the data, the
//! ensemble, the residual variance and the random number generator of one
//! chain, and iterates (steps) on them. Between iterations the owner may
//! replace predictor columns, the response or the offset, which is how the
//! sampler is embedded in a larger Gibbs sampler.
//!
//! A chain starts in the warm-up phase, where leaves without training
//! observations are tolerated. [`BartState::finish_warmup`] moves it to the
//! sampling phase, after which every leaf must keep at least one observation.

use log::{debug, error, info, warn};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::data::DataMatrix;
use crate::error::BartError;
use crate::forest::Forest;
use crate::math::sample_variance;
use crate::ops::{sample_latent, Response, TreeSamplingOps};
use crate::proposal::{MoveStatistics, ProposalEngine};
use crate::rng::{BartRng, RngAlgorithm};
use crate::sampler::{SampleRecord, Samples};
use crate::settings::{BartSettings, TreeInit};
use crate::snapshot::ChainSnapshot;
use crate::tree::{DecisionTree, TreeError};
use crate::variance::VariancePrior;

/// Relative tolerance of the aggregation check in
/// [`BartState::check_invariants`].
const AGGREGATION_TOLERANCE: f64 = 1e-8;

/// Phase of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Burn-in: empty leaves are tolerated.
    WarmUp,
    /// Empty leaves are forbidden.
    Sampling,
}

/// Iteration counters of a chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCounters {
    /// Burn-in iterations consumed.
    pub burn_in: usize,
    /// Samples produced.
    pub samples: usize,
    /// Iterations since the last retained sample.
    pub thinning: usize,
    /// Total iterations.
    pub iterations: usize,
}

/// BartState is the main entry point of the sampler for one chain.
#[derive(Debug)]
pub struct BartState {
    settings: BartSettings,
    data: DataMatrix,
    tree_ops: TreeSamplingOps,
    variance_prior: VariancePrior,
    forest: Forest,
    sigma2: f64,
    latent: Option<Array1<f64>>,
    rng: BartRng,
    phase: Phase,
    counters: ChainCounters,
    stats: MoveStatistics,
    chain: usize,
    poisoned: bool,
}

impl BartState {
    /// Creates chain `chain` with a generator of `settings.rng_algorithm`
    /// seeded from `settings.seed + chain`.
    ///
    /// # Examples
    ///
    /// ```
    /// use bart_mcmc::{BartSettings, BartState, DataMatrix};
    /// use ndarray::array;
    ///
    /// let x = array![[0.0], [1.0], [2.0], [3.0]];
    /// let y = array![1.0, 2.0, 3.0, 4.0];
    /// let data = DataMatrix::continuous(x, y).unwrap();
    /// let settings = BartSettings { n_trees: 5, ..BartSettings::default() };
    /// let mut state = BartState::new(settings, data, 0).unwrap();
    /// state.step().unwrap();
    /// assert!(state.variance() > 0.0);
    /// ```
    pub fn new(settings: BartSettings, data: DataMatrix, chain: usize) -> Result<Self, BartError> {
        if settings.rng_algorithm == RngAlgorithm::User {
            return Err(BartError::RngState(
                "user generators are supplied through BartState::with_rng".to_string(),
            ));
        }
        let rng = BartRng::new(
            settings.rng_algorithm,
            settings.normal_algorithm,
            settings.seed.wrapping_add(chain as u64),
        )?;
        Self::with_rng(settings, data, chain, rng)
    }

    /// Creates a chain drawing from `rng`.
    pub fn with_rng(
        settings: BartSettings,
        data: DataMatrix,
        chain: usize,
        mut rng: BartRng,
    ) -> Result<Self, BartError> {
        settings.validate()?;
        if settings.response == Response::Probit {
            check_binary(data.y().view())?;
        }
        let tree_ops = settings.tree_ops();
        let variance_prior = settings.variance_prior()?;

        let target = data.y() - data.offset();
        let n = data.n_obs();
        let m = settings.n_trees;
        let trees = match settings.tree_init {
            TreeInit::Stump => {
                let value = match settings.response {
                    Response::Continuous => target.mean().unwrap_or(0.0) / m as f64,
                    Response::Probit => 0.0,
                };
                vec![DecisionTree::new(value, n); m]
            }
            TreeInit::Prior => {
                let engine = ProposalEngine::new(&tree_ops, &settings.moves, &data);
                (0..m)
                    .map(|_| engine.draw_from_prior(&mut rng))
                    .collect::<Result<Vec<_>, TreeError>>()?
            }
        };
        let forest = Forest::new(trees, &data);

        let sigma2 = match settings.response {
            Response::Probit => 1.0,
            Response::Continuous => settings
                .initial_variance
                .or_else(|| sample_variance(target.view()).filter(|v| *v > 0.0))
                .unwrap_or(variance_prior.lambda),
        };

        info!(
            "chain {} initialised: {} trees, {} observations, {} predictors",
            chain,
            m,
            n,
            data.n_vars()
        );

        Ok(Self {
            settings,
            data,
            tree_ops,
            variance_prior,
            forest,
            sigma2,
            latent: None,
            rng,
            phase: Phase::WarmUp,
            counters: ChainCounters::default(),
            stats: MoveStatistics::default(),
            chain,
            poisoned: false,
        })
    }

    /// Rebuilds a chain from a snapshot taken with [`BartState::store_state`].
    pub fn restore(snapshot: ChainSnapshot) -> Result<Self, BartError> {
        let ChainSnapshot {
            settings,
            data,
            mut forest,
            variance,
            latent,
            rng,
            phase,
            counters,
            stats,
            chain,
        } = snapshot;

        settings.validate()?;
        if forest.n_trees() != settings.n_trees {
            return Err(BartError::DimensionMismatch {
                what: "snapshot trees",
                expected: settings.n_trees,
                found: forest.n_trees(),
            });
        }
        forest.reroute_all(data.x());

        let state = Self {
            tree_ops: settings.tree_ops(),
            variance_prior: settings.variance_prior()?,
            settings,
            data,
            forest,
            sigma2: variance,
            latent,
            rng: BartRng::from_state(rng)?,
            phase,
            counters,
            stats,
            chain,
            poisoned: false,
        };
        state.check_invariants()?;
        Ok(state)
    }

    /// Captures the chain in a snapshot from which [`BartState::restore`]
    /// resumes it bit-for-bit.
    pub fn store_state(&self) -> Result<ChainSnapshot, BartError> {
        self.ensure_healthy()?;
        Ok(ChainSnapshot {
            settings: self.settings.clone(),
            data: self.data.clone(),
            forest: self.forest.clone(),
            variance: self.sigma2,
            latent: self.latent.clone(),
            rng: self.rng.state()?,
            phase: self.phase,
            counters: self.counters,
            stats: self.stats.clone(),
            chain: self.chain,
        })
    }

    /// Runs one iteration: a backfitting sweep over every tree followed by a
    /// variance draw. Probit chains first redraw the latent response.
    pub fn step(&mut self) -> Result<(), BartError> {
        self.ensure_healthy()?;

        let target = match self.settings.response {
            Response::Continuous => self.data.y() - self.data.offset(),
            Response::Probit => {
                let latent = self.draw_latent();
                let target = &latent - self.data.offset();
                self.latent = Some(latent);
                target
            }
        };

        let engine = ProposalEngine::new(&self.tree_ops, &self.settings.moves, &self.data);
        let allow_empty = self.phase == Phase::WarmUp;
        let swept = self.forest.sweep(
            &engine,
            &self.data,
            target.view(),
            self.sigma2,
            &mut self.rng,
            &mut self.stats,
            allow_empty,
        );
        if let Err(err) = swept {
            if matches!(err, BartError::InvariantBreach { .. }) {
                error!("chain {} poisoned: {}", self.chain, err);
                self.poisoned = true;
            }
            return Err(err);
        }

        if self.settings.response == Response::Continuous {
            let residuals = &target - self.forest.predictions();
            self.sigma2 = self.variance_prior.sample(residuals.view(), &mut self.rng)?;
        }

        self.counters.iterations += 1;
        debug!(
            "chain {} iteration {}: sigma2 = {:.6}",
            self.chain, self.counters.iterations, self.sigma2
        );
        Ok(())
    }

    /// Runs `n_burn` warm-up iterations, switches to the sampling phase and
    /// collects `n_samples` samples spaced `n_thin` iterations apart.
    pub fn run(&mut self, n_burn: usize, n_samples: usize) -> Result<Samples, BartError> {
        for _ in 0..n_burn {
            self.step()?;
            self.counters.burn_in += 1;
        }
        if self.phase == Phase::WarmUp {
            self.finish_warmup()?;
        }

        let mut samples = Samples::new(self.chain);
        for _ in 0..n_samples {
            for _ in 0..self.settings.n_thin {
                self.step()?;
                self.counters.thinning += 1;
            }
            samples.push(self.record());
            self.counters.thinning = 0;
            self.counters.samples += 1;
        }

        info!(
            "chain {} finished: {} burn-in iterations, {} samples, {} iterations in total",
            self.chain, n_burn, n_samples, self.counters.iterations
        );
        Ok(samples)
    }

    /// Leaves the warm-up phase. Remaining empty splits are coalesced; the
    /// switch cannot be undone.
    pub fn finish_warmup(&mut self) -> Result<(), BartError> {
        self.ensure_healthy()?;
        if self.phase == Phase::Sampling {
            return Ok(());
        }
        let removed = self.forest.coalesce_empty_splits(self.data.x_test());
        self.phase = Phase::Sampling;
        info!(
            "chain {} entered the sampling phase after {} iterations ({} empty splits coalesced)",
            self.chain, self.counters.iterations, removed
        );
        Ok(())
    }

    /// Replaces training predictor `column`.
    ///
    /// Without `force_update` the replacement is applied only if no tree ends
    /// up with a new empty leaf; otherwise nothing changes and `Ok(false)` is
    /// returned. With `force_update` it is always applied and the splits left
    /// with an empty side are coalesced.
    pub fn set_predictor(
        &mut self,
        column: usize,
        values: ArrayView1<f64>,
        force_update: bool,
    ) -> Result<bool, BartError> {
        self.ensure_healthy()?;
        self.data.validate_column(column, values)?;

        let previous = self.data.replace_column(column, values);
        let (trees, conflict) = self.reroute_trees(|tree| tree.splits_on(column));
        if conflict && !force_update {
            self.data.replace_column(column, previous.view());
            debug!(
                "chain {}: update of predictor {} rejected, it would empty a leaf",
                self.chain, column
            );
            return Ok(false);
        }
        self.commit_trees(trees);
        Ok(true)
    }

    /// Replaces the whole training predictor matrix, with the semantics of
    /// [`BartState::set_predictor`].
    pub fn set_predictors(&mut self, x: Array2<f64>, force_update: bool) -> Result<bool, BartError> {
        self.ensure_healthy()?;
        self.data
            .validate_matrix(x.view(), self.data.n_obs(), "predictors")?;

        let previous = self.data.replace_x(x);
        let (trees, conflict) = self.reroute_trees(|_| true);
        if conflict && !force_update {
            self.data.replace_x(previous);
            debug!(
                "chain {}: update of the predictor matrix rejected, it would empty a leaf",
                self.chain
            );
            return Ok(false);
        }
        self.commit_trees(trees);
        Ok(true)
    }

    /// Replaces test predictor `column`. Tree structures are unaffected.
    pub fn set_test_predictor(&mut self, column: usize, values: ArrayView1<f64>) -> Result<(), BartError> {
        self.ensure_healthy()?;
        self.data.set_test_column(column, values)?;
        self.forest.refresh_test(self.data.x_test());
        Ok(())
    }

    /// Replaces the test set and its offset (zero when `None`).
    pub fn set_test_predictors(
        &mut self,
        x_test: Array2<f64>,
        offset_test: Option<Array1<f64>>,
    ) -> Result<(), BartError> {
        self.ensure_healthy()?;
        self.data.set_test(x_test, offset_test)?;
        self.forest.refresh_test(self.data.x_test());
        Ok(())
    }

    /// Replaces the test offset. Test predictions shift accordingly.
    pub fn set_test_offset(&mut self, offset_test: Array1<f64>) -> Result<(), BartError> {
        self.ensure_healthy()?;
        self.data.set_test_offset(offset_test)
    }

    /// Replaces the training response.
    pub fn set_response(&mut self, y: Array1<f64>) -> Result<(), BartError> {
        self.ensure_healthy()?;
        if self.settings.response == Response::Probit {
            check_binary(y.view())?;
        }
        self.data.set_response(y)
    }

    /// Replaces the training offset.
    pub fn set_offset(&mut self, offset: Array1<f64>) -> Result<(), BartError> {
        self.ensure_healthy()?;
        self.data.set_offset(offset)
    }

    /// Installs `tree` as tree `index`, for example to warm start a chain.
    /// In the sampling phase the tree must not have empty leaves on the
    /// current data.
    pub fn set_tree(&mut self, index: usize, mut tree: DecisionTree) -> Result<(), BartError> {
        self.ensure_healthy()?;
        if index >= self.forest.n_trees() {
            return Err(BartError::DimensionMismatch {
                what: "tree index",
                expected: self.forest.n_trees(),
                found: index,
            });
        }
        if let Some(variable) = tree
            .internal_nodes()
            .into_iter()
            .filter_map(|node| tree.rule(node).map(|rule| rule.variable()))
            .find(|&variable| variable >= self.data.n_vars())
        {
            return Err(BartError::InvalidPredictor {
                column: variable,
                reason: "the tree splits on a column that does not exist".to_string(),
            });
        }
        tree.reroute_all(self.data.x());
        if self.phase == Phase::Sampling {
            if let Some(&leaf) = tree.empty_leaves().first() {
                return Err(BartError::Tree(TreeError::EmptyLeaf(leaf)));
            }
        }
        self.forest.install(index, tree, self.data.x_test());
        Ok(())
    }

    /// Verifies the chain invariants: aggregated fits match the per-tree fits,
    /// the variance is positive and, in the sampling phase, no leaf is empty.
    pub fn check_invariants(&self) -> Result<(), BartError> {
        let scale = self
            .forest
            .predictions()
            .iter()
            .chain(self.forest.test_predictions().iter())
            .fold(1.0f64, |acc, v| acc.max(v.abs()));
        let deviation = self.forest.aggregation_error();
        if deviation > AGGREGATION_TOLERANCE * scale {
            return Err(BartError::AggregationMismatch { deviation });
        }
        if !(self.sigma2.is_finite() && self.sigma2 > 0.0) {
            return Err(BartError::InvalidConfiguration(format!(
                "residual variance {} is not positive",
                self.sigma2
            )));
        }
        if self.phase == Phase::Sampling {
            if let Some((tree, node)) = self.forest.empty_leaf() {
                return Err(BartError::InvariantBreach { tree, node });
            }
        }
        Ok(())
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current residual variance.
    pub fn variance(&self) -> f64 {
        self.sigma2
    }

    /// Training fit, offset included.
    pub fn predictions(&self) -> Array1<f64> {
        self.forest.predictions() + self.data.offset()
    }

    /// Test fit, offset included.
    pub fn test_predictions(&self) -> Array1<f64> {
        self.forest.test_predictions() + self.data.offset_test()
    }

    /// Number of splits on each predictor across the ensemble.
    pub fn variable_inclusion(&self) -> Vec<u32> {
        self.forest.variable_counts(self.data.n_vars())
    }

    /// The ensemble.
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// The data.
    pub fn data(&self) -> &DataMatrix {
        &self.data
    }

    /// The settings.
    pub fn settings(&self) -> &BartSettings {
        &self.settings
    }

    /// Iteration counters.
    pub fn counters(&self) -> &ChainCounters {
        &self.counters
    }

    /// Proposal and acceptance counts.
    pub fn move_statistics(&self) -> &MoveStatistics {
        &self.stats
    }

    /// Latent response of a probit chain after its first iteration.
    pub fn latent(&self) -> Option<&Array1<f64>> {
        self.latent.as_ref()
    }

    /// Chain index.
    pub fn chain(&self) -> usize {
        self.chain
    }

    /// Whether an invariant breach stopped the chain.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn ensure_healthy(&self) -> Result<(), BartError> {
        if self.poisoned {
            Err(BartError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn record(&self) -> SampleRecord {
        SampleRecord {
            variance: self.sigma2,
            train_fit: self.settings.keep_train_fits.then(|| self.predictions()),
            test_fit: self.test_predictions(),
            variable_counts: self.variable_inclusion(),
        }
    }

    fn draw_latent(&mut self) -> Array1<f64> {
        let predictions = self.forest.predictions();
        let offset = self.data.offset();
        let y = self.data.y();
        let rng = &mut self.rng;
        (0..y.len())
            .map(|i| sample_latent(predictions[i] + offset[i], y[i] > 0.5, rng))
            .collect()
    }

    /// Reroutes copies of the trees selected by `affected` over the current
    /// training data. The flag reports whether some leaf that held
    /// observations before is left empty.
    fn reroute_trees<F>(&self, affected: F) -> (Vec<(usize, DecisionTree)>, bool)
    where
        F: Fn(&DecisionTree) -> bool,
    {
        let mut rerouted = Vec::new();
        let mut conflict = false;
        for (j, tree) in self.forest.trees().iter().enumerate() {
            if !affected(tree) {
                continue;
            }
            let mut candidate = tree.clone();
            candidate.reroute_all(self.data.x());
            conflict |= candidate
                .empty_leaves()
                .into_iter()
                .any(|leaf| !tree.observations(leaf).is_empty());
            rerouted.push((j, candidate));
        }
        (rerouted, conflict)
    }

    /// Installs rerouted trees after coalescing the splits left with an
    /// empty side.
    fn commit_trees(&mut self, trees: Vec<(usize, DecisionTree)>) {
        for (j, mut tree) in trees {
            let removed = tree.coalesce_empty_splits();
            if removed > 0 {
                warn!(
                    "chain {}: forced predictor update coalesced {} splits of tree {}",
                    self.chain, removed, j
                );
            }
            self.forest.install(j, tree, self.data.x_test());
        }
    }
}

fn check_binary(y: ArrayView1<f64>) -> Result<(), BartError> {
    if y.iter().any(|&v| v != 0.0 && v != 1.0) {
        return Err(BartError::InvalidConfiguration(
            "a probit response must only contain 0 and 1".to_string(),
        ));
    }
    Ok(())
}
