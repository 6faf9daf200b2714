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

//! Training and test data held by a chain.
//!
//! A `DataMatrix` stores the predictor matrix `x` (observations by columns),
//! the response `y`, an offset, and an optional test set sharing the column
//! schema. Every column has a [`Predictor`] describing how it may be split:
//! continuous columns carry a sorted set of candidate cutpoints computed once
//! at construction, categorical columns carry their number of levels.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::BartError;
use crate::split_rules::{ContinuousSplit, SplitRuleType, SubsetSplit};

/// Largest number of levels a categorical predictor may have.
pub const MAX_CATEGORICAL_LEVELS: usize = 32;

/// How a predictor column is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictorKind {
    /// Ordered numeric values split at a cutpoint.
    Continuous,
    /// Level codes `0..n_levels` split by level subsets.
    Categorical {
        /// Number of levels.
        n_levels: usize,
    },
}

/// Options controlling the cutpoints of continuous predictors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutpointOptions {
    /// Maximum number of cutpoints per continuous column.
    pub n_cuts: usize,
    /// Place cutpoints at evenly spaced order statistics instead of on a
    /// uniform grid between the minimum and maximum.
    pub use_quantiles: bool,
}

impl Default for CutpointOptions {
    fn default() -> Self {
        Self {
            n_cuts: 100,
            use_quantiles: false,
        }
    }
}

/// Column schema: kind and candidate split points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictor {
    kind: PredictorKind,
    cutpoints: Vec<f64>,
}

impl Predictor {
    /// Creates a continuous predictor with cutpoints derived from `values`.
    ///
    /// When the column has at most `n_cuts + 1` distinct values, the cutpoints
    /// are the midpoints between adjacent distinct values so every partition is
    /// reachable.
    pub fn continuous(values: ArrayView1<f64>, options: &CutpointOptions) -> Self {
        Self {
            kind: PredictorKind::Continuous,
            cutpoints: compute_cutpoints(values, options),
        }
    }

    /// Creates a categorical predictor with `n_levels` levels.
    pub fn categorical(n_levels: usize) -> Self {
        Self {
            kind: PredictorKind::Categorical { n_levels },
            cutpoints: Vec::new(),
        }
    }

    /// Kind of this predictor.
    pub fn kind(&self) -> PredictorKind {
        self.kind
    }

    /// Sorted cutpoints; empty for categorical predictors.
    pub fn cutpoints(&self) -> &[f64] {
        &self.cutpoints
    }

    /// Split strategy used by the proposal engine for this column.
    pub fn strategy(&self) -> SplitRuleType<'_> {
        match self.kind {
            PredictorKind::Continuous => SplitRuleType::Continuous(ContinuousSplit {
                cutpoints: &self.cutpoints,
            }),
            PredictorKind::Categorical { n_levels } => {
                SplitRuleType::Subset(SubsetSplit { n_levels })
            }
        }
    }

    fn check_value(&self, value: f64) -> Result<(), String> {
        if !value.is_finite() {
            return Err(format!("non-finite value {}", value));
        }
        if let PredictorKind::Categorical { n_levels } = self.kind {
            if value < 0.0 || value.fract() != 0.0 || value >= n_levels as f64 {
                return Err(format!(
                    "value {} is not a level code in 0..{}",
                    value, n_levels
                ));
            }
        }
        Ok(())
    }
}

fn compute_cutpoints(values: ArrayView1<f64>, options: &CutpointOptions) -> Vec<f64> {
    let mut unique: Vec<f64> = values.iter().copied().collect();
    unique.sort_by(f64::total_cmp);
    unique.dedup();

    if unique.len() < 2 || options.n_cuts == 0 {
        return Vec::new();
    }

    if unique.len() - 1 <= options.n_cuts {
        return unique.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
    }

    let n_cuts = options.n_cuts;
    let mut cuts: Vec<f64> = if options.use_quantiles {
        (1..=n_cuts)
            .map(|k| {
                let idx = k * (unique.len() - 1) / (n_cuts + 1);
                0.5 * (unique[idx] + unique[idx + 1])
            })
            .collect()
    } else {
        let min = unique[0];
        let max = unique[unique.len() - 1];
        let step = (max - min) / (n_cuts + 1) as f64;
        (1..=n_cuts).map(|k| min + k as f64 * step).collect()
    };
    cuts.dedup();
    cuts
}

/// Predictor columns, response and offsets for the train and test sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMatrix {
    predictors: Vec<Predictor>,
    x: Array2<f64>,
    y: Array1<f64>,
    offset: Array1<f64>,
    x_test: Array2<f64>,
    offset_test: Array1<f64>,
}

impl DataMatrix {
    /// Creates a training set.
    ///
    /// `x` has one row per observation and one column per predictor; `kinds`
    /// gives the kind of each column. The offset starts at zero and the test
    /// set empty.
    pub fn new(
        x: Array2<f64>,
        y: Array1<f64>,
        kinds: &[PredictorKind],
        options: CutpointOptions,
    ) -> Result<Self, BartError> {
        let n = x.nrows();
        if n == 0 {
            return Err(BartError::InvalidConfiguration(
                "at least one training observation is required".to_string(),
            ));
        }
        if x.ncols() == 0 {
            return Err(BartError::InvalidConfiguration(
                "at least one predictor is required".to_string(),
            ));
        }
        check_len("response", n, y.len())?;
        check_len("predictor kinds", x.ncols(), kinds.len())?;
        check_finite("response", y.view())?;
        if options.n_cuts == 0 {
            return Err(BartError::InvalidConfiguration(
                "the number of cutpoints must be positive".to_string(),
            ));
        }

        let mut predictors = Vec::with_capacity(kinds.len());
        for (column, kind) in kinds.iter().enumerate() {
            let predictor = match *kind {
                PredictorKind::Continuous => Predictor::continuous(x.column(column), &options),
                PredictorKind::Categorical { n_levels } => {
                    if !(1..=MAX_CATEGORICAL_LEVELS).contains(&n_levels) {
                        return Err(BartError::InvalidPredictor {
                            column,
                            reason: format!(
                                "categorical predictors need 1..={} levels, got {}",
                                MAX_CATEGORICAL_LEVELS, n_levels
                            ),
                        });
                    }
                    Predictor::categorical(n_levels)
                }
            };
            predictors.push(predictor);
        }

        let p = x.ncols();
        let data = Self {
            predictors,
            x,
            y,
            offset: Array1::zeros(n),
            x_test: Array2::zeros((0, p)),
            offset_test: Array1::zeros(0),
        };
        for column in 0..p {
            data.check_column(column, data.x.column(column))?;
        }

        Ok(data)
    }

    /// Creates a training set in which every column is continuous.
    pub fn continuous(x: Array2<f64>, y: Array1<f64>) -> Result<Self, BartError> {
        let kinds = vec![PredictorKind::Continuous; x.ncols()];
        Self::new(x, y, &kinds, CutpointOptions::default())
    }

    /// Sets the training offset.
    pub fn with_offset(mut self, offset: Array1<f64>) -> Result<Self, BartError> {
        self.set_offset(offset)?;
        Ok(self)
    }

    /// Sets the test set and its offset (zero when `None`).
    pub fn with_test(
        mut self,
        x_test: Array2<f64>,
        offset_test: Option<Array1<f64>>,
    ) -> Result<Self, BartError> {
        self.set_test(x_test, offset_test)?;
        Ok(self)
    }

    /// Number of training observations.
    pub fn n_obs(&self) -> usize {
        self.x.nrows()
    }

    /// Number of test observations.
    pub fn n_test(&self) -> usize {
        self.x_test.nrows()
    }

    /// Number of predictor columns.
    pub fn n_vars(&self) -> usize {
        self.predictors.len()
    }

    /// Column schemas.
    pub fn predictors(&self) -> &[Predictor] {
        &self.predictors
    }

    /// Schema of column `column`.
    pub fn predictor(&self, column: usize) -> &Predictor {
        &self.predictors[column]
    }

    /// Training predictors.
    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    /// Training response.
    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    /// Training offset.
    pub fn offset(&self) -> &Array1<f64> {
        &self.offset
    }

    /// Test predictors.
    pub fn x_test(&self) -> &Array2<f64> {
        &self.x_test
    }

    /// Test offset.
    pub fn offset_test(&self) -> &Array1<f64> {
        &self.offset_test
    }

    /// Checks that `values` can replace training column `column`.
    pub fn validate_column(&self, column: usize, values: ArrayView1<f64>) -> Result<(), BartError> {
        self.check_index(column)?;
        check_len("predictor column", self.n_obs(), values.len())?;
        self.check_column(column, values)
    }

    /// Checks that `x` has `rows` rows and values valid for every column.
    pub fn validate_matrix(
        &self,
        x: ArrayView2<f64>,
        rows: usize,
        what: &'static str,
    ) -> Result<(), BartError> {
        check_len(what, rows, x.nrows())?;
        check_len(what, self.n_vars(), x.ncols())?;
        for (column, values) in x.axis_iter(Axis(1)).enumerate() {
            self.check_column(column, values)?;
        }
        Ok(())
    }

    /// Writes `values` into training column `column` and returns the previous
    /// column. Callers validate first.
    pub(crate) fn replace_column(&mut self, column: usize, values: ArrayView1<f64>) -> Array1<f64> {
        let previous = self.x.column(column).to_owned();
        self.x.column_mut(column).assign(&values);
        previous
    }

    /// Swaps in a whole training matrix and returns the previous one. Callers
    /// validate first.
    pub(crate) fn replace_x(&mut self, x: Array2<f64>) -> Array2<f64> {
        std::mem::replace(&mut self.x, x)
    }

    /// Replaces test column `column`.
    pub fn set_test_column(&mut self, column: usize, values: ArrayView1<f64>) -> Result<(), BartError> {
        self.check_index(column)?;
        check_len("test predictor column", self.n_test(), values.len())?;
        self.check_column(column, values)?;
        self.x_test.column_mut(column).assign(&values);
        Ok(())
    }

    /// Replaces the test set. The test offset is reset to zero when `None`.
    pub fn set_test(
        &mut self,
        x_test: Array2<f64>,
        offset_test: Option<Array1<f64>>,
    ) -> Result<(), BartError> {
        self.validate_matrix(x_test.view(), x_test.nrows(), "test predictors")?;
        let offset_test = match offset_test {
            Some(offset) => {
                check_len("test offset", x_test.nrows(), offset.len())?;
                check_finite("test offset", offset.view())?;
                offset
            }
            None => Array1::zeros(x_test.nrows()),
        };
        self.x_test = x_test;
        self.offset_test = offset_test;
        Ok(())
    }

    /// Replaces the test offset.
    pub fn set_test_offset(&mut self, offset_test: Array1<f64>) -> Result<(), BartError> {
        check_len("test offset", self.n_test(), offset_test.len())?;
        check_finite("test offset", offset_test.view())?;
        self.offset_test = offset_test;
        Ok(())
    }

    /// Replaces the training response.
    pub fn set_response(&mut self, y: Array1<f64>) -> Result<(), BartError> {
        check_len("response", self.n_obs(), y.len())?;
        check_finite("response", y.view())?;
        self.y = y;
        Ok(())
    }

    /// Replaces the training offset.
    pub fn set_offset(&mut self, offset: Array1<f64>) -> Result<(), BartError> {
        check_len("offset", self.n_obs(), offset.len())?;
        check_finite("offset", offset.view())?;
        self.offset = offset;
        Ok(())
    }

    fn check_index(&self, column: usize) -> Result<(), BartError> {
        if column >= self.n_vars() {
            return Err(BartError::InvalidPredictor {
                column,
                reason: format!("only {} columns exist", self.n_vars()),
            });
        }
        Ok(())
    }

    fn check_column(&self, column: usize, values: ArrayView1<f64>) -> Result<(), BartError> {
        let predictor = &self.predictors[column];
        for &value in values.iter() {
            predictor
                .check_value(value)
                .map_err(|reason| BartError::InvalidPredictor { column, reason })?;
        }
        Ok(())
    }
}

fn check_len(what: &'static str, expected: usize, found: usize) -> Result<(), BartError> {
    if expected != found {
        return Err(BartError::DimensionMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

fn check_finite(what: &str, values: ArrayView1<f64>) -> Result<(), BartError> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(BartError::InvalidConfiguration(format!(
            "{} contains non-finite values",
            what
        )));
    }
    Ok(())
}
