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
#![warn(missing_docs)]

//! bart_mcmc provides a Markov chain Monte Carlo sampler for Bayesian
//! Additive Regression Trees (BART). BART is a non-parametric method to
//! approximate functions based on the sum of many trees where priors are
//! used to regularize inference, mainly by restricting a tree's learning
//! capacity so that no individual tree is able to explain the data, but
//! rather the sum of trees.
//!
//! Inference follows Chipman, George and McCulloch [2010]: trees are updated
//! one at a time against the partial residuals of the others (Bayesian
//! backfitting) with Metropolis-Hastings grow, prune, change and swap moves,
//! followed by a conjugate draw of the residual variance.
//!
//! Predictor columns may be replaced while a chain runs, with the guarantee
//! that no tree is left with a leaf holding no training observation once
//! the chain has left its warm-up phase. This lets the sampler serve as one
//! block of a larger Gibbs sampler in which covariates are themselves latent.

pub mod data;
pub mod error;
pub mod forest;
pub mod math;
pub mod ops;
pub mod proposal;
pub mod rng;
pub mod sampler;
pub mod settings;
pub mod snapshot;
pub mod split_rules;
pub mod state;
pub mod tree;
pub mod variance;

#[cfg(feature = "python")]
mod python;

pub use crate::data::{CutpointOptions, DataMatrix, Predictor, PredictorKind};
pub use crate::error::BartError;
pub use crate::ops::Response;
pub use crate::proposal::{MoveKind, MoveProbabilities, MoveStatistics};
pub use crate::rng::{BartRng, NormalAlgorithm, RngAlgorithm};
pub use crate::sampler::{SampleRecord, Sampler, Samples};
pub use crate::settings::{BartSettings, TreeInit};
pub use crate::snapshot::ChainSnapshot;
pub use crate::state::{BartState, ChainCounters, Phase};
pub use crate::tree::{DecisionTree, TreeError, TreeMove};
