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

//! Implements the tree prior, the conjugate leaf model and the response kinds.
//!
//! This module provides functionality for:
//! - Evaluating and sampling the depth penalty of the tree structure prior
//! - Integrating leaf means out of the Gaussian likelihood
//! - Drawing leaf means from their conjugate posterior
//! - Drawing the latent response of a probit model
//!
//! The `TreeSamplingOps` struct holds the prior parameters shared by every
//! tree of a chain.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::rng::BartRng;

/// Variants indicate how the observed response relates to the sum of trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Gaussian response with unknown variance.
    #[default]
    Continuous,
    /// Binary 0/1 response with a probit link, handled through a latent
    /// Gaussian response whose variance is fixed at one.
    Probit,
}

impl FromStr for Response {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continuous" | "gaussian" => Ok(Response::Continuous),
            "probit" | "binary" => Ok(Response::Probit),
            _ => Err(format!("Unknown response type: {}", s)),
        }
    }
}

/// Holds parameters used for sampling-related operations of BART.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSamplingOps {
    /// Parameter contained with (0, 1) used to control node depth during the
    /// growing of trees.
    pub alpha: f64,
    /// Parameter contained with [0, infinity) used to control node depth
    /// during the growing of trees.
    pub beta: f64,
    /// Prior standard deviation of the leaf means.
    pub leaf_sd: f64,
}

impl TreeSamplingOps {
    /// Prior probability that a node at `depth` is split, `alpha * (1 + depth)^-beta`.
    #[inline]
    pub fn split_probability(&self, depth: usize) -> f64 {
        self.alpha * (1.0 + depth as f64).powf(-self.beta)
    }

    /// Log prior of a split node at `depth`.
    #[inline]
    pub fn log_split_prior(&self, depth: usize) -> f64 {
        self.split_probability(depth).ln()
    }

    /// Log prior of a leaf node at `depth`.
    #[inline]
    pub fn log_leaf_prior(&self, depth: usize) -> f64 {
        (1.0 - self.split_probability(depth)).ln()
    }

    /// Sample a boolean flag indicating if a node should be split or not.
    ///
    /// The deeper a leaf node, the greater the prior probability it will
    /// remain a leaf node.
    pub fn sample_expand_flag(&self, depth: usize, rng: &mut BartRng) -> bool {
        rng.uniform() < self.split_probability(depth)
    }

    /// Log marginal likelihood of a leaf holding `n` residuals that sum to
    /// `sum`, with the leaf mean integrated out under its N(0, leaf_sd²) prior.
    ///
    /// Terms that do not depend on the tree structure are dropped.
    pub fn leaf_log_likelihood(&self, n: usize, sum: f64, sigma2: f64) -> f64 {
        let tau2 = self.leaf_sd * self.leaf_sd;
        let n_tau2 = n as f64 * tau2;
        -0.5 * (1.0 + n_tau2 / sigma2).ln()
            + tau2 * sum * sum / (2.0 * sigma2 * (sigma2 + n_tau2))
    }

    /// Sample a leaf mean from its conjugate normal posterior given `n`
    /// residuals summing to `sum`. With `n == 0` this is a prior draw.
    pub fn sample_leaf_value(&self, n: usize, sum: f64, sigma2: f64, rng: &mut BartRng) -> f64 {
        let tau2 = self.leaf_sd * self.leaf_sd;
        let denom = sigma2 + n as f64 * tau2;
        let mean = tau2 * sum / denom;
        let sd = (sigma2 * tau2 / denom).sqrt();
        mean + sd * rng.normal()
    }

    /// Sample a leaf mean from its N(0, leaf_sd²) prior.
    pub fn sample_prior_leaf_value(&self, rng: &mut BartRng) -> f64 {
        self.leaf_sd * rng.normal()
    }
}

/// Draws the latent response of a probit observation: N(`mean`, 1)
/// truncated to the positive half line when `positive`, and to the negative
/// half line otherwise.
pub fn sample_latent(mean: f64, positive: bool, rng: &mut BartRng) -> f64 {
    if positive {
        mean + sample_lower_truncated(-mean, rng)
    } else {
        mean - sample_lower_truncated(mean, rng)
    }
}

/// Standard normal deviate conditioned on exceeding `bound`.
///
/// Plain rejection is used while `bound <= 0`, where at least half of the
/// draws are accepted. Further out, Robert's (1995) translated exponential
/// proposal is used.
pub fn sample_lower_truncated(bound: f64, rng: &mut BartRng) -> f64 {
    if bound <= 0.0 {
        loop {
            let z = rng.normal();
            if z > bound {
                return z;
            }
        }
    }

    let rate = 0.5 * (bound + (bound * bound + 4.0).sqrt());
    loop {
        // 1 - u lies in (0, 1], so the logarithm is finite.
        let z = bound - (1.0 - rng.uniform()).ln() / rate;
        let rho = (-0.5 * (z - rate) * (z - rate)).exp();
        if rng.uniform() < rho {
            return z;
        }
    }
}
