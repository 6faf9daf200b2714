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

//! Persisted chain state.
//!
//! A `ChainSnapshot` is produced by [`crate::state::BartState::store_state`]
//! and consumed by [`crate::state::BartState::restore`]. The observation
//! caches of the trees are not stored; they are rebuilt from the data on
//! restore. Floats are written with enough digits to round-trip exactly.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::data::DataMatrix;
use crate::error::BartError;
use crate::forest::Forest;
use crate::proposal::MoveStatistics;
use crate::rng::RngState;
use crate::settings::BartSettings;
use crate::state::{ChainCounters, Phase};

/// Serialisable state of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub(crate) settings: BartSettings,
    pub(crate) data: DataMatrix,
    pub(crate) forest: Forest,
    pub(crate) variance: f64,
    pub(crate) latent: Option<ndarray::Array1<f64>>,
    pub(crate) rng: RngState,
    pub(crate) phase: Phase,
    pub(crate) counters: ChainCounters,
    pub(crate) stats: MoveStatistics,
    pub(crate) chain: usize,
}

impl ChainSnapshot {
    /// Encodes the snapshot as JSON.
    pub fn to_json(&self) -> Result<String, BartError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a snapshot from JSON.
    pub fn from_json(json: &str) -> Result<Self, BartError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Writes the JSON encoding to `writer`.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), BartError> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Reads a JSON encoded snapshot from `reader`.
    pub fn read_from<R: Read>(reader: R) -> Result<Self, BartError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Settings of the stored chain.
    pub fn settings(&self) -> &BartSettings {
        &self.settings
    }

    /// Phase of the stored chain.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Iteration counters of the stored chain.
    pub fn counters(&self) -> &ChainCounters {
        &self.counters
    }
}
