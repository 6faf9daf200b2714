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

//! Split rule definitions and strategies for decision trees. The module
//! supports counting and sampling the rules that divide a set of observations
//! into two non-empty groups, and dividing observations by a chosen rule.
//!
//! Includes:
//! - `SplitRule`: the rule stored on an internal node.
//! - `SplitStrategy`: trait defining the interface for split strategies.
//! - `ContinuousSplit`: cutpoint splits for continuous variables.
//! - `SubsetSplit`: level subset splits for categorical variables.
//! - `SplitRuleType`: enum encapsulating the different split strategies.

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Rule carried by an internal node. Observations for which
/// [`SplitRule::goes_left`] holds are routed to the left child.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SplitRule {
    /// `x <= threshold` goes left. The threshold is one of the predictor's
    /// cutpoints.
    Continuous {
        /// Predictor column.
        variable: usize,
        /// Threshold value.
        threshold: f64,
    },
    /// Levels whose bit is set in `left_levels` go left.
    Categorical {
        /// Predictor column.
        variable: usize,
        /// Bit mask over level codes.
        left_levels: u64,
    },
}

impl SplitRule {
    /// Predictor column this rule splits on.
    #[inline]
    pub fn variable(&self) -> usize {
        match self {
            SplitRule::Continuous { variable, .. } | SplitRule::Categorical { variable, .. } => {
                *variable
            }
        }
    }

    /// Whether a value of the split variable is routed left.
    #[inline]
    pub fn goes_left(&self, value: f64) -> bool {
        match self {
            SplitRule::Continuous { threshold, .. } => value <= *threshold,
            SplitRule::Categorical { left_levels, .. } => {
                let level = value as u32;
                level < u64::BITS && (left_levels >> level) & 1 == 1
            }
        }
    }
}

/// Divides `observations` (row indices of `x`) into the rows routed left and
/// right by `rule`, preserving their order.
pub fn divide(rule: &SplitRule, x: &Array2<f64>, observations: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let variable = rule.variable();
    observations
        .iter()
        .copied()
        .partition(|&i| rule.goes_left(x[[i, variable]]))
}

/// Split strategy interface. `values` are the values of one predictor for the
/// observations reaching a node.
pub trait SplitStrategy {
    /// Number of distinct rules dividing `values` into two non-empty groups.
    fn count_rules(&self, values: &[f64]) -> u64;

    /// Samples uniformly one of the rules counted by [`count_rules`], or `None`
    /// when there are none.
    ///
    /// [`count_rules`]: SplitStrategy::count_rules
    fn sample_rule<R: Rng + ?Sized>(
        &self,
        variable: usize,
        values: &[f64],
        rng: &mut R,
    ) -> Option<SplitRule>;
}

/// Standard continuous split rule: pick a cutpoint and split depending on
/// whether the variable is smaller than or equal to it.
pub struct ContinuousSplit<'a> {
    /// Sorted candidate thresholds of the predictor.
    pub cutpoints: &'a [f64],
}

impl ContinuousSplit<'_> {
    /// Range of cutpoint indices `c` with `min(values) <= c < max(values)`.
    fn valid_cuts(&self, values: &[f64]) -> std::ops::Range<usize> {
        if values.is_empty() {
            return 0..0;
        }
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let lo = self.cutpoints.partition_point(|&c| c < min);
        let hi = self.cutpoints.partition_point(|&c| c < max);
        lo..hi.max(lo)
    }
}

impl SplitStrategy for ContinuousSplit<'_> {
    fn count_rules(&self, values: &[f64]) -> u64 {
        self.valid_cuts(values).len() as u64
    }

    fn sample_rule<R: Rng + ?Sized>(
        &self,
        variable: usize,
        values: &[f64],
        rng: &mut R,
    ) -> Option<SplitRule> {
        let cuts = self.valid_cuts(values);
        if cuts.is_empty() {
            return None;
        }
        Some(SplitRule::Continuous {
            variable,
            threshold: self.cutpoints[rng.gen_range(cuts)],
        })
    }
}

/// Choose a random subset of the categorical levels present at a node and
/// branch on belonging to that set. Levels absent from the node go right.
///
/// This is the approach taken by Sameer K. Deshpande.
/// flexBART: Flexible Bayesian regression trees with categorical predictors. arXiv,
/// `link <https://arxiv.org/abs/2211.04459>`__
pub struct SubsetSplit {
    /// Number of levels of the predictor.
    pub n_levels: usize,
}

impl SubsetSplit {
    fn present_levels(&self, values: &[f64]) -> u64 {
        values
            .iter()
            .fold(0u64, |mask, &v| mask | (1u64 << (v as u32)))
    }
}

impl SplitStrategy for SubsetSplit {
    fn count_rules(&self, values: &[f64]) -> u64 {
        let k = self.present_levels(values).count_ones();
        if k < 2 {
            0
        } else {
            (1u64 << k) - 2
        }
    }

    fn sample_rule<R: Rng + ?Sized>(
        &self,
        variable: usize,
        values: &[f64],
        rng: &mut R,
    ) -> Option<SplitRule> {
        let present = self.present_levels(values);
        let k = present.count_ones();
        if k < 2 {
            return None;
        }

        // Subsets of the k present levels, excluding the empty and full sets.
        let full = (1u64 << k) - 1;
        let bits = loop {
            let bits = rng.next_u64() & full;
            if bits != 0 && bits != full {
                break bits;
            }
        };

        let mut left_levels = 0u64;
        let mut position = 0;
        for level in 0..self.n_levels as u32 {
            if (present >> level) & 1 == 1 {
                if (bits >> position) & 1 == 1 {
                    left_levels |= 1u64 << level;
                }
                position += 1;
            }
        }

        Some(SplitRule::Categorical {
            variable,
            left_levels,
        })
    }
}

/// Holds the split strategies as enum variants.
pub enum SplitRuleType<'a> {
    /// Continuous implements the `ContinuousSplit` strategy.
    Continuous(ContinuousSplit<'a>),
    /// Subset implements the `SubsetSplit` strategy.
    Subset(SubsetSplit),
}

impl SplitStrategy for SplitRuleType<'_> {
    fn count_rules(&self, values: &[f64]) -> u64 {
        match self {
            SplitRuleType::Continuous(rule) => rule.count_rules(values),
            SplitRuleType::Subset(rule) => rule.count_rules(values),
        }
    }

    fn sample_rule<R: Rng + ?Sized>(
        &self,
        variable: usize,
        values: &[f64],
        rng: &mut R,
    ) -> Option<SplitRule> {
        match self {
            SplitRuleType::Continuous(rule) => rule.sample_rule(variable, values, rng),
            SplitRuleType::Subset(rule) => rule.sample_rule(variable, values, rng),
        }
    }
}
