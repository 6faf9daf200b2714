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

//! Independent chains run in parallel, and the draws they produce.

use log::info;
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::DataMatrix;
use crate::error::BartError;
use crate::rng::RngAlgorithm;
use crate::settings::BartSettings;
use crate::state::BartState;

/// Posterior draw retained after thinning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Residual variance.
    pub variance: f64,
    /// Training fit with offset, when `keep_train_fits` is set.
    pub train_fit: Option<Array1<f64>>,
    /// Test fit with offset.
    pub test_fit: Array1<f64>,
    /// Splits per predictor across the ensemble.
    pub variable_counts: Vec<u32>,
}

/// Draws of one chain, in iteration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Samples {
    /// Chain index.
    pub chain: usize,
    /// Retained draws.
    pub records: Vec<SampleRecord>,
}

impl Samples {
    /// Creates an empty set of draws for `chain`.
    pub fn new(chain: usize) -> Self {
        Self {
            chain,
            records: Vec::new(),
        }
    }

    /// Appends a draw.
    pub fn push(&mut self, record: SampleRecord) {
        self.records.push(record);
    }

    /// Number of draws.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no draw was retained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Variance draws.
    pub fn variances(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.variance).collect()
    }

    /// Posterior mean of the test fit, or `None` without draws.
    pub fn mean_test_fit(&self) -> Option<Array1<f64>> {
        let first = self.records.first()?;
        let mut mean = Array1::zeros(first.test_fit.len());
        for record in &self.records {
            mean += &record.test_fit;
        }
        Some(mean / self.records.len() as f64)
    }

    /// Posterior mean of the training fit, or `None` when no training fits
    /// were kept.
    pub fn mean_train_fit(&self) -> Option<Array1<f64>> {
        let fits: Vec<&Array1<f64>> = self
            .records
            .iter()
            .map(|r| r.train_fit.as_ref())
            .collect::<Option<_>>()?;
        let first = fits.first()?;
        let mut mean = Array1::zeros(first.len());
        for fit in &fits {
            mean += *fit;
        }
        Some(mean / fits.len() as f64)
    }
}

/// Runs `n_chains` independent chains on the rayon thread pool.
#[derive(Debug)]
pub struct Sampler {
    chains: Vec<BartState>,
    n_burn: usize,
    n_samples: usize,
}

impl Sampler {
    /// Builds every chain. Chain `c` owns a copy of `data` and a generator
    /// seeded from `settings.seed + c`.
    pub fn new(settings: BartSettings, data: DataMatrix) -> Result<Self, BartError> {
        settings.validate()?;
        if settings.rng_algorithm == RngAlgorithm::User {
            return Err(BartError::RngState(
                "the multi-chain sampler cannot seed user generators".to_string(),
            ));
        }
        let chains = (0..settings.n_chains)
            .map(|chain| BartState::new(settings.clone(), data.clone(), chain))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            chains,
            n_burn: settings.n_burn,
            n_samples: settings.n_samples,
        })
    }

    /// Builds a sampler from existing chains, for example restored snapshots.
    pub fn from_chains(chains: Vec<BartState>, n_burn: usize, n_samples: usize) -> Self {
        Self {
            chains,
            n_burn,
            n_samples,
        }
    }

    /// Runs burn-in, the switch to the sampling phase and sampling on every
    /// chain in parallel. Returns one `Samples` per chain, in chain order.
    pub fn run(&mut self) -> Result<Vec<Samples>, BartError> {
        info!(
            "running {} chains: {} burn-in iterations, {} samples each",
            self.chains.len(),
            self.n_burn,
            self.n_samples
        );
        let (n_burn, n_samples) = (self.n_burn, self.n_samples);
        self.chains
            .par_iter_mut()
            .map(|chain| chain.run(n_burn, n_samples))
            .collect()
    }

    /// The chains.
    pub fn chains(&self) -> &[BartState] {
        &self.chains
    }

    /// Mutable access to the chains, for predictor updates between runs.
    pub fn chains_mut(&mut self) -> &mut [BartState] {
        &mut self.chains
    }

    /// Consumes the sampler.
    pub fn into_chains(self) -> Vec<BartState> {
        self.chains
    }
}
