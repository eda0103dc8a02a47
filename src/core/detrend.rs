use crate::core::design_matrix::{RegressorRow, RegressorSet};
use crate::core::preprocess::Observation;
use crate::core::regression::CoefficientGrid;
use crate::types::{DerivedLayer, HarmonicError, HarmonicResult, SeriesLayer};

/// Layer name of detrended observations
pub const DETRENDED: &str = "detrended";
/// Layer name of model values
pub const FITTED: &str = "fitted";
/// Layer name of observed minus model values
pub const RESIDUAL: &str = "residual";

/// Removes a fitted model from observations, or evaluates it.
///
/// The detrender is bound to one regressor list; a grid fitted with any
/// other list (names or order) is rejected.
#[derive(Debug, Clone)]
pub struct TrendDetrender {
    regressors: RegressorSet,
}

impl TrendDetrender {
    pub fn new(regressors: RegressorSet) -> Self {
        Self { regressors }
    }

    pub fn regressors(&self) -> &RegressorSet {
        &self.regressors
    }

    /// `observed − Σ coef_i · regressor_i(t)`
    pub fn detrended(&self, obs: &Observation, grid: &CoefficientGrid) -> HarmonicResult<SeriesLayer> {
        self.difference(DETRENDED, obs, grid)
    }

    /// `Σ coef_i · regressor_i(t)`, defined wherever the pixel was solved
    pub fn fitted(&self, obs: &Observation, grid: &CoefficientGrid) -> HarmonicResult<SeriesLayer> {
        let row = self.regressor_row(obs, grid)?;
        let layer = DerivedLayer::from_fn(FITTED, obs.dim(), obs.index.geo_transform, |r, c| {
            grid.predict(r, c, &row)
        });
        Ok(series_layer(obs, layer))
    }

    /// `observed − fitted`
    pub fn residual(&self, obs: &Observation, grid: &CoefficientGrid) -> HarmonicResult<SeriesLayer> {
        self.difference(RESIDUAL, obs, grid)
    }

    /// Apply one of the per-observation operations to a whole series
    pub fn series<F>(
        &self,
        observations: &[Observation],
        grid: &CoefficientGrid,
        op: F,
    ) -> HarmonicResult<Vec<SeriesLayer>>
    where
        F: Fn(&Self, &Observation, &CoefficientGrid) -> HarmonicResult<SeriesLayer>,
    {
        observations.iter().map(|obs| op(self, obs, grid)).collect()
    }

    fn difference(&self, name: &str, obs: &Observation, grid: &CoefficientGrid) -> HarmonicResult<SeriesLayer> {
        let row = self.regressor_row(obs, grid)?;
        let layer = DerivedLayer::from_fn(name, obs.dim(), obs.index.geo_transform, |r, c| {
            let y = obs.response(r, c)?;
            grid.predict(r, c, &row).map(|fitted| y - fitted)
        });
        Ok(series_layer(obs, layer))
    }

    fn regressor_row(&self, obs: &Observation, grid: &CoefficientGrid) -> HarmonicResult<RegressorRow> {
        if grid.regressors() != &self.regressors {
            return Err(HarmonicError::InvalidConfiguration(format!(
                "Coefficients were fitted with {:?}, not {:?}",
                grid.regressors().names(),
                self.regressors.names()
            )));
        }
        if obs.dim() != grid.dim() {
            return Err(HarmonicError::ShapeMismatch(format!(
                "Observation '{}' is {:?}, coefficient grid is {:?}",
                obs.acquisition_id,
                obs.dim(),
                grid.dim()
            )));
        }
        Ok(grid.builder().row(obs.t))
    }
}

fn series_layer(obs: &Observation, layer: DerivedLayer) -> SeriesLayer {
    SeriesLayer {
        acquisition_id: obs.acquisition_id.clone(),
        time: obs.time,
        t: obs.t,
        layer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::design_matrix::DesignMatrixBuilder;
    use crate::core::regression::{PerPixelRegressionSolver, QrSolver};
    use chrono::{DateTime, Utc};

    fn observations(times: &[f64]) -> Vec<Observation> {
        times
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let index = DerivedLayer::from_fn("index", (2, 2), None, |r, c| {
                    // pixel (1, 1) is masked in the third acquisition
                    if (r, c) == (1, 1) && i == 2 {
                        None
                    } else {
                        Some(0.2 + 0.05 * t + 0.01 * (i % 3) as f64 + 0.1 * r as f64)
                    }
                });
                Observation::from_index(format!("a{}", i), DateTime::<Utc>::default(), t, index)
            })
            .collect()
    }

    fn trend_grid(obs: &[Observation]) -> CoefficientGrid {
        let builder = DesignMatrixBuilder::new(RegressorSet::linear_trend(), 1.0).unwrap();
        PerPixelRegressionSolver::new(builder, Box::new(QrSolver))
            .fit(obs)
            .unwrap()
    }

    #[test]
    fn test_fitted_plus_residual_reproduces_observation() {
        let obs = observations(&[10.0, 10.3, 10.9, 11.4, 12.0]);
        let grid = trend_grid(&obs);
        let detrender = TrendDetrender::new(RegressorSet::linear_trend());

        for o in &obs {
            let fitted = detrender.fitted(o, &grid).unwrap();
            let residual = detrender.residual(o, &grid).unwrap();
            for r in 0..2 {
                for c in 0..2 {
                    if let Some(y) = o.response(r, c) {
                        let sum = fitted.layer.get(r, c).unwrap() + residual.layer.get(r, c).unwrap();
                        assert!((sum - y).abs() < 1e-9);
                    }
                }
            }
        }
    }

    #[test]
    fn test_masked_observation_keeps_fitted_value() {
        let obs = observations(&[10.0, 10.3, 10.9, 11.4, 12.0]);
        let grid = trend_grid(&obs);
        let detrender = TrendDetrender::new(RegressorSet::linear_trend());

        let detrended = detrender.detrended(&obs[2], &grid).unwrap();
        assert!(detrended.layer.get(1, 1).is_none());
        assert!(detrended.layer.get(0, 0).is_some());

        let fitted = detrender.fitted(&obs[2], &grid).unwrap();
        assert!(fitted.layer.get(1, 1).is_some());
        assert_eq!(fitted.acquisition_id, "a2");
        assert_eq!(fitted.t, 10.9);
    }

    #[test]
    fn test_regressor_mismatch_rejected() {
        let obs = observations(&[10.0, 10.3, 10.9, 11.4, 12.0]);
        let grid = trend_grid(&obs);

        let reordered = RegressorSet::from_names(&["t", "constant"]).unwrap();
        let detrender = TrendDetrender::new(reordered);
        assert!(matches!(
            detrender.detrended(&obs[0], &grid),
            Err(HarmonicError::InvalidConfiguration(_))
        ));

        let harmonic = TrendDetrender::new(RegressorSet::harmonic(1).unwrap());
        assert!(harmonic.fitted(&obs[0], &grid).is_err());
    }

    #[test]
    fn test_series_covers_every_observation() {
        let obs = observations(&[10.0, 10.3, 10.9, 11.4, 12.0]);
        let grid = trend_grid(&obs);
        let detrender = TrendDetrender::new(RegressorSet::linear_trend());

        let series = detrender.series(&obs, &grid, TrendDetrender::detrended).unwrap();
        assert_eq!(series.len(), obs.len());
        let ids: Vec<&str> = series.iter().map(|s| s.acquisition_id.as_str()).collect();
        assert_eq!(ids, vec!["a0", "a1", "a2", "a3", "a4"]);
    }
}
