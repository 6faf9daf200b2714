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
#![allow(non_snake_case)]

//! Python bindings of a single chain.

use std::str::FromStr;

use numpy::{PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::data::{CutpointOptions, DataMatrix, PredictorKind};
use crate::error::BartError;
use crate::ops::Response;
use crate::settings::BartSettings;
use crate::state::BartState;

fn to_py_err(err: BartError) -> PyErr {
    match err {
        BartError::InvariantBreach { .. } | BartError::Poisoned => {
            PyRuntimeError::new_err(err.to_string())
        }
        other => PyValueError::new_err(other.to_string()),
    }
}

/// `StateWrapper` wraps around `BartState` to hold the state of one chain.
///
/// This class is `unsendable`, i.e., it cannot be sent across threads safely.
#[pyclass(unsendable)]
struct StateWrapper {
    state: BartState,
}

#[pyfunction]
#[pyo3(signature = (X, y, n_levels, n_trees=200, alpha=0.95, beta=2.0, response="continuous", seed=0, X_test=None))]
#[allow(clippy::too_many_arguments)]
fn initialize(
    X: PyReadonlyArray2<f64>,
    y: PyReadonlyArray1<f64>,
    n_levels: Vec<usize>,
    n_trees: usize,
    alpha: f64,
    beta: f64,
    response: &str,
    seed: u64,
    X_test: Option<PyReadonlyArray2<f64>>,
) -> PyResult<StateWrapper> {
    // A level count of zero marks a continuous column.
    let kinds: Vec<PredictorKind> = n_levels
        .into_iter()
        .map(|n| match n {
            0 => PredictorKind::Continuous,
            n_levels => PredictorKind::Categorical { n_levels },
        })
        .collect();
    let response = Response::from_str(response).map_err(PyValueError::new_err)?;

    let mut data = DataMatrix::new(
        X.as_array().to_owned(),
        y.as_array().to_owned(),
        &kinds,
        CutpointOptions::default(),
    )
    .map_err(to_py_err)?;
    if let Some(x_test) = X_test {
        data = data
            .with_test(x_test.as_array().to_owned(), None)
            .map_err(to_py_err)?;
    }

    let settings = BartSettings {
        n_trees,
        alpha,
        beta,
        response,
        seed,
        ..BartSettings::default()
    }
    .calibrated(&data)
    .map_err(to_py_err)?;
    let state = BartState::new(settings, data, 0).map_err(to_py_err)?;

    Ok(StateWrapper { state })
}

#[pymethods]
impl StateWrapper {
    /// Runs one iteration and returns the training fit and the variable
    /// inclusion counts.
    fn step<'py>(
        &mut self,
        py: Python<'py>,
    ) -> PyResult<(Bound<'py, PyArray1<f64>>, Bound<'py, PyArray1<u32>>)> {
        self.state.step().map_err(to_py_err)?;
        let predictions = self.state.predictions();
        let inclusion = self.state.variable_inclusion();
        Ok((
            PyArray1::from_array_bound(py, &predictions.view()),
            PyArray1::from_vec_bound(py, inclusion),
        ))
    }

    /// Runs burn-in and sampling; returns the variance draws and the test
    /// fits, one row per draw.
    fn run<'py>(
        &mut self,
        py: Python<'py>,
        n_burn: usize,
        n_samples: usize,
    ) -> PyResult<(Bound<'py, PyArray1<f64>>, Bound<'py, PyArray2<f64>>)> {
        let samples = self.state.run(n_burn, n_samples).map_err(to_py_err)?;
        let n_test = self.state.data().n_test();
        let mut fits = ndarray::Array2::zeros((samples.len(), n_test));
        for (mut row, record) in fits.outer_iter_mut().zip(samples.records.iter()) {
            row.assign(&record.test_fit);
        }
        Ok((
            PyArray1::from_vec_bound(py, samples.variances()),
            PyArray2::from_owned_array_bound(py, fits),
        ))
    }

    fn set_predictor(
        &mut self,
        column: usize,
        values: PyReadonlyArray1<f64>,
        force_update: bool,
    ) -> PyResult<bool> {
        self.state
            .set_predictor(column, values.as_array(), force_update)
            .map_err(to_py_err)
    }

    fn set_test_predictor(&mut self, column: usize, values: PyReadonlyArray1<f64>) -> PyResult<()> {
        self.state
            .set_test_predictor(column, values.as_array())
            .map_err(to_py_err)
    }

    fn finish_warmup(&mut self) -> PyResult<()> {
        self.state.finish_warmup().map_err(to_py_err)
    }

    /// Returns the JSON snapshot of the chain.
    fn store_state(&self) -> PyResult<String> {
        self.state
            .store_state()
            .and_then(|snapshot| snapshot.to_json())
            .map_err(to_py_err)
    }

    #[getter]
    fn variance(&self) -> f64 {
        self.state.variance()
    }
}

#[pymodule]
fn bart_mcmc(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(initialize, m)?)?;
    m.add_class::<StateWrapper>()?;

    Ok(())
}
