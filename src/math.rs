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

//! Small numerical helpers.

use std::f64::consts::SQRT_2;

use ndarray::ArrayView1;
use statrs::function::erf::erfc_inv;

/// Cumulative sum of `values` normalized so that the last element is one.
pub fn normalized_cumsum(values: &[f64]) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    values
        .iter()
        .scan(0.0, |acc, &x| {
            *acc += x;
            Some(*acc / total)
        })
        .collect()
}

/// Index of the first entry of the cumulative distribution `cdf` that exceeds
/// `u`. Entries with zero mass are never selected for `u` in `[0, 1)`.
pub fn sample_cumulative(cdf: &[f64], u: f64) -> usize {
    for (idx, value) in cdf.iter().enumerate() {
        if u < *value {
            return idx;
        }
    }

    cdf.len() - 1
}

/// Quantile function of the standard normal distribution.
#[inline]
pub fn standard_normal_quantile(p: f64) -> f64 {
    -SQRT_2 * erfc_inv(2.0 * p)
}

/// Sum of squared entries.
pub fn sum_of_squares(values: ArrayView1<f64>) -> f64 {
    values.iter().map(|v| v * v).sum()
}

/// Unbiased sample variance, or `None` for fewer than two values.
pub fn sample_variance(values: ArrayView1<f64>) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let mean = values.sum() / n as f64;
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    Some(ss / (n - 1) as f64)
}
