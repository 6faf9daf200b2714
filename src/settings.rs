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

//! Settings used to initialize a new `BartState` or `Sampler`.

use serde::{Deserialize, Serialize};

use crate::data::DataMatrix;
use crate::error::BartError;
use crate::math::sample_variance;
use crate::ops::{Response, TreeSamplingOps};
use crate::proposal::MoveProbabilities;
use crate::rng::{NormalAlgorithm, RngAlgorithm};
use crate::variance::VariancePrior;

/// How the trees of a new chain are initialised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeInit {
    /// Every tree is a single leaf holding `mean(y - offset) / n_trees`.
    #[default]
    Stump,
    /// Every tree is drawn from the tree prior.
    Prior,
}

/// BartSettings are setting parameters used to initialize a new chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BartSettings {
    /// Number of trees in the ensemble.
    pub n_trees: usize,
    /// Base of the depth penalty, in (0, 1).
    pub alpha: f64,
    /// Power of the depth penalty, non-negative.
    pub beta: f64,
    /// Prior standard deviation of the leaf means.
    pub leaf_sd: f64,
    /// Degrees of freedom of the variance prior.
    pub nu: f64,
    /// Scale of the variance prior.
    pub lambda: f64,
    /// Warm-up iterations.
    pub n_burn: usize,
    /// Retained samples.
    pub n_samples: usize,
    /// Iterations per retained sample.
    pub n_thin: usize,
    /// Independent chains run by the `Sampler`.
    pub n_chains: usize,
    /// Proposal probabilities of the structural moves.
    pub moves: MoveProbabilities,
    /// Response kind.
    pub response: Response,
    /// Tree initialisation.
    pub tree_init: TreeInit,
    /// Starting residual variance. Defaults to the sample variance of
    /// `y - offset`.
    pub initial_variance: Option<f64>,
    /// Whether samples record the training fit.
    pub keep_train_fits: bool,
    /// Seed of chain 0; chain `c` uses `seed + c`.
    pub seed: u64,
    /// Uniform generator.
    pub rng_algorithm: RngAlgorithm,
    /// Normal deviate algorithm.
    pub normal_algorithm: NormalAlgorithm,
}

impl Default for BartSettings {
    fn default() -> Self {
        let n_trees = 200;
        Self {
            n_trees,
            alpha: 0.95,
            beta: 2.0,
            leaf_sd: 0.5 / (2.0 * (n_trees as f64).sqrt()),
            nu: 3.0,
            lambda: 1.0,
            n_burn: 100,
            n_samples: 1000,
            n_thin: 1,
            n_chains: 1,
            moves: MoveProbabilities::default(),
            response: Response::default(),
            tree_init: TreeInit::default(),
            initial_variance: None,
            keep_train_fits: true,
            seed: 0,
            rng_algorithm: RngAlgorithm::default(),
            normal_algorithm: NormalAlgorithm::default(),
        }
    }
}

impl BartSettings {
    /// Multiplier of the leaf prior: the sum of trees is expected to stay
    /// within `k` prior standard deviations of the response range.
    pub const K: f64 = 2.0;
    /// Degrees of freedom used by [`BartSettings::calibrated`].
    pub const CALIBRATION_NU: f64 = 3.0;
    /// Prior probability of `sigma` falling below the sample standard
    /// deviation, used by [`BartSettings::calibrated`].
    pub const CALIBRATION_QUANTILE: f64 = 0.9;

    /// Checks every setting.
    pub fn validate(&self) -> Result<(), BartError> {
        let invalid = |msg: String| Err(BartError::InvalidConfiguration(msg));

        if self.n_trees == 0 {
            return invalid("the number of trees must be positive".to_string());
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return invalid(format!("alpha must lie in (0, 1), got {}", self.alpha));
        }
        if !(self.beta.is_finite() && self.beta >= 0.0) {
            return invalid(format!("beta must be non-negative, got {}", self.beta));
        }
        if !(self.leaf_sd.is_finite() && self.leaf_sd > 0.0) {
            return invalid(format!("leaf_sd must be positive, got {}", self.leaf_sd));
        }
        VariancePrior::new(self.nu, self.lambda)?;
        if self.n_thin == 0 {
            return invalid("the thinning interval must be positive".to_string());
        }
        if self.n_chains == 0 {
            return invalid("the number of chains must be positive".to_string());
        }
        if let Some(variance) = self.initial_variance {
            if !(variance.is_finite() && variance > 0.0) {
                return invalid(format!("initial variance must be positive, got {}", variance));
            }
        }
        self.moves.validate()
    }

    /// Applies the default data-driven priors.
    ///
    /// For a continuous response the leaf prior puts the range of
    /// `y - offset` at `±K` standard deviations of the sum of trees and the
    /// variance prior uses `nu = 3` with 90% prior mass below the sample
    /// variance. For a probit response the leaf prior uses `3 / (K sqrt(m))`.
    pub fn calibrated(mut self, data: &DataMatrix) -> Result<Self, BartError> {
        let sqrt_m = (self.n_trees.max(1) as f64).sqrt();
        match self.response {
            Response::Probit => {
                self.leaf_sd = 3.0 / (Self::K * sqrt_m);
            }
            Response::Continuous => {
                let target = data.y() - data.offset();
                let (min, max) = target
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    });
                if max > min {
                    self.leaf_sd = (max - min) / (2.0 * Self::K * sqrt_m);
                }
                if let Some(variance) = sample_variance(target.view()).filter(|v| *v > 0.0) {
                    let prior = VariancePrior::from_quantile(
                        Self::CALIBRATION_NU,
                        Self::CALIBRATION_QUANTILE,
                        variance.sqrt(),
                    )?;
                    self.nu = prior.nu;
                    self.lambda = prior.lambda;
                }
            }
        }
        Ok(self)
    }

    /// Tree prior operations described by these settings.
    pub fn tree_ops(&self) -> TreeSamplingOps {
        TreeSamplingOps {
            alpha: self.alpha,
            beta: self.beta,
            leaf_sd: self.leaf_sd,
        }
    }

    /// Variance prior described by these settings.
    pub fn variance_prior(&self) -> Result<VariancePrior, BartError> {
        VariancePrior::new(self.nu, self.lambda)
    }
}
