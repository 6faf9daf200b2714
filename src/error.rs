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

//! Error types shared by every component of the sampler.
//!
//! Infeasible proposals and rejected predictor updates are not errors: the
//! former are automatic rejections inside the proposal engine and the latter
//! are reported as `Ok(false)` by [`crate::state::BartState::set_predictor`].

use thiserror::Error;

use crate::tree::TreeError;

/// Errors raised while configuring or running a BART chain.
#[derive(Debug, Error)]
pub enum BartError {
    /// A setting or a combination of settings is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An input vector or matrix has the wrong length.
    #[error("dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Which input was malformed.
        what: &'static str,
        /// Expected length.
        expected: usize,
        /// Length that was supplied.
        found: usize,
    },

    /// A predictor column cannot be used as supplied.
    #[error("invalid predictor column {column}: {reason}")]
    InvalidPredictor {
        /// Column index.
        column: usize,
        /// Human readable reason.
        reason: String,
    },

    /// A leaf without training observations was found after warm-up.
    ///
    /// This indicates a logic defect; the chain that raised it is poisoned.
    #[error("invariant breach: leaf {node} of tree {tree} has no training observations")]
    InvariantBreach {
        /// Index of the offending tree in the ensemble.
        tree: usize,
        /// Arena index of the empty leaf.
        node: usize,
    },

    /// The running fit totals drifted away from the sum of the per-tree fits.
    #[error("aggregated fit deviates from the sum of tree fits by {deviation}")]
    AggregationMismatch {
        /// Largest absolute deviation.
        deviation: f64,
    },

    /// The chain previously hit an invariant breach and refuses to continue.
    #[error("chain was poisoned by an earlier invariant breach")]
    Poisoned,

    /// The random number generator state cannot be captured or restored.
    #[error("random number generator state unavailable: {0}")]
    RngState(String),

    /// Structural misuse of the tree API.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Snapshot (de)serialization failed, including I/O errors of the
    /// underlying reader or writer.
    #[error("snapshot serialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}
