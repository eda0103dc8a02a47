//! phenocycle: per-pixel harmonic regression of vegetation index time series
//!
//! Fits a linear trend and an annual harmonic model to every pixel of a
//! stack of satellite acquisitions and derives phase (timing of peak
//! greenness) and amplitude (strength of seasonality) rasters.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, GeoTransform, DerivedLayer, SeriesLayer, PixelStatus, FitFailure,
    HarmonicError, HarmonicResult,
};
pub use config::{HarmonicConfig, Rescale, SolverKind};
pub use io::{Acquisition, AcquisitionFilter, AcquisitionSource, MemorySource, LayerSink, MemorySink};
pub use crate::core::{HarmonicPipeline, PipelineOutput};

#[cfg(feature = "python")]
mod python {
    use crate::core::design_matrix::{DesignMatrixBuilder, RegressorSet};
    use crate::core::phase_amplitude::PhaseAmplitudeDeriver;
    use crate::core::preprocess::Observation;
    use crate::core::regression::{PerPixelRegressionSolver, QrSolver};
    use crate::types::{DerivedLayer, HarmonicError};
    use chrono::{DateTime, Utc};
    use numpy::{IntoPyArray, PyArray2, PyArray3, PyReadonlyArray1, PyReadonlyArray3};
    use pyo3::prelude::*;

    fn to_py_err(e: HarmonicError) -> PyErr {
        match e {
            HarmonicError::InvalidConfiguration(_) | HarmonicError::ShapeMismatch(_) => {
                PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
            }
            _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)),
        }
    }

    /// Fit `{constant, t, cos, sin, ...}` to an (n, rows, cols) index stack.
    ///
    /// Non-finite values are treated as masked. Returns the coefficient cube
    /// and the first-order phase and amplitude rasters.
    #[pyfunction]
    #[pyo3(signature = (index, t, harmonic_order = 1, fundamental_frequency = 1.0, amplitude_scale = 1.0))]
    fn fit_harmonics<'py>(
        py: Python<'py>,
        index: PyReadonlyArray3<'py, f64>,
        t: PyReadonlyArray1<'py, f64>,
        harmonic_order: u32,
        fundamental_frequency: f64,
        amplitude_scale: f64,
    ) -> PyResult<(&'py PyArray3<f64>, &'py PyArray2<f64>, &'py PyArray2<f64>)> {
        let stack = index.as_array();
        let times = t.as_array();
        let (n, rows, cols) = stack.dim();
        if times.len() != n {
            return Err(to_py_err(HarmonicError::ShapeMismatch(format!(
                "{} time coordinates for {} index layers",
                times.len(),
                n
            ))));
        }

        let observations: Vec<Observation> = times
            .iter()
            .enumerate()
            .map(|(i, &ti)| {
                let layer = DerivedLayer::from_fn("index", (rows, cols), None, |r, c| {
                    let v = stack[[i, r, c]];
                    v.is_finite().then_some(v)
                });
                Observation::from_index(format!("obs{}", i), DateTime::<Utc>::default(), ti, layer)
            })
            .collect();

        let regressors = RegressorSet::harmonic(harmonic_order).map_err(to_py_err)?;
        let builder = DesignMatrixBuilder::new(regressors, fundamental_frequency).map_err(to_py_err)?;
        let grid = PerPixelRegressionSolver::new(builder, Box::new(QrSolver))
            .fit(&observations)
            .map_err(to_py_err)?;
        let first = PhaseAmplitudeDeriver::new(amplitude_scale)
            .and_then(|d| d.derive(&grid, 1))
            .map_err(to_py_err)?;

        Ok((
            grid.coefficients().to_owned().into_pyarray(py),
            first.phase.values.into_pyarray(py),
            first.amplitude.values.into_pyarray(py),
        ))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(fit_harmonics, m)?)?;
        Ok(())
    }
}
