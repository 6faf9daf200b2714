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

//! Conjugate draw of the residual variance.

use ndarray::ArrayView1;
use rand_distr::{ChiSquared, Distribution};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared as ChiSquaredDist, ContinuousCDF};

use crate::error::BartError;
use crate::math::sum_of_squares;
use crate::rng::BartRng;

/// Scaled inverse chi-square prior `sigma² ~ nu * lambda / chi²(nu)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariancePrior {
    /// Degrees of freedom.
    pub nu: f64,
    /// Scale.
    pub lambda: f64,
}

impl VariancePrior {
    /// Creates a prior with positive `nu` and `lambda`.
    pub fn new(nu: f64, lambda: f64) -> Result<Self, BartError> {
        if !(nu.is_finite() && nu > 0.0) {
            return Err(BartError::InvalidConfiguration(format!(
                "variance prior degrees of freedom must be positive, got {}",
                nu
            )));
        }
        if !(lambda.is_finite() && lambda > 0.0) {
            return Err(BartError::InvalidConfiguration(format!(
                "variance prior scale must be positive, got {}",
                lambda
            )));
        }
        Ok(Self { nu, lambda })
    }

    /// Chooses `lambda` so that the prior puts probability `quantile` on
    /// `sigma < sigma_hat`.
    pub fn from_quantile(nu: f64, quantile: f64, sigma_hat: f64) -> Result<Self, BartError> {
        if !(quantile > 0.0 && quantile < 1.0) {
            return Err(BartError::InvalidConfiguration(format!(
                "variance prior quantile must lie in (0, 1), got {}",
                quantile
            )));
        }
        let chi2 = ChiSquaredDist::new(nu)
            .map_err(|err| BartError::InvalidConfiguration(err.to_string()))?;
        let lambda = sigma_hat * sigma_hat * chi2.inverse_cdf(1.0 - quantile) / nu;
        Self::new(nu, lambda)
    }

    /// Draws `sigma²` from its posterior given the current residuals
    /// `y - offset - fit`. The draw is strictly positive.
    pub fn sample(&self, residuals: ArrayView1<f64>, rng: &mut BartRng) -> Result<f64, BartError> {
        let ssr = sum_of_squares(residuals);
        let n = residuals.len() as f64;
        let chi2 = ChiSquared::new(self.nu + n)
            .map_err(|err| BartError::InvalidConfiguration(err.to_string()))?;
        let draw = (self.nu * self.lambda + ssr) / chi2.sample(rng);
        Ok(draw.max(f64::MIN_POSITIVE))
    }
}
