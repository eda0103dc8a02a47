//! End-to-end harmonic pipeline
//!
//! Filter → preprocess → trend and harmonic regressions → derived layers.
//! Every stage is an eager transform over in-memory rasters; nothing is
//! read from or written to disk here.

use crate::config::HarmonicConfig;
use crate::core::design_matrix::{DesignMatrixBuilder, RegressorSet};
use crate::core::detrend::TrendDetrender;
use crate::core::phase_amplitude::{seasonality_composite, PhaseAmplitudeDeriver};
use crate::core::preprocess::{Observation, ObservationPreprocessor, INDEX_LAYER};
use crate::core::regression::{solver_for, CoefficientGrid, PerPixelRegressionSolver};
use crate::io::{Acquisition, AcquisitionFilter, AcquisitionSource, LayerSink};
use crate::types::{BoundingBox, DerivedLayer, HarmonicError, HarmonicResult, SeriesLayer};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

pub const NDVI_MOSAIC: &str = "ndvi_mosaic";
pub const MEAN_NDVI: &str = "mean_ndvi";
pub const RESIDUAL_RMS: &str = "residual_rms";
pub const OBSERVATION_COUNT: &str = "observation_count";

pub const DETRENDED_SERIES: &str = "detrended_series";
pub const FITTED_SERIES: &str = "fitted_series";
pub const RESIDUAL_SERIES: &str = "residual_series";
pub const INDEX_SERIES: &str = "index_series";

/// An acquisition that could not be turned into an observation
#[derive(Debug)]
pub struct DroppedAcquisition {
    pub acquisition_id: String,
    pub error: HarmonicError,
}

/// Observed and modelled values of one pixel at one acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct PixelSample {
    pub acquisition_id: String,
    pub time: DateTime<Utc>,
    pub t: f64,
    pub observed: Option<f64>,
    pub fitted: Option<f64>,
    pub detrended: Option<f64>,
}

/// Everything one pipeline run produces
#[derive(Debug)]
pub struct PipelineOutput {
    /// Accepted observations, sorted by time
    pub observations: Vec<Observation>,
    /// `{constant, t}` pass
    pub trend: CoefficientGrid,
    /// Harmonic pass
    pub harmonic: CoefficientGrid,
    pub layers: Vec<DerivedLayer>,
    pub detrended_series: Vec<SeriesLayer>,
    pub fitted_series: Vec<SeriesLayer>,
    pub residual_series: Vec<SeriesLayer>,
    pub index_series: Vec<SeriesLayer>,
    pub dropped: Vec<DroppedAcquisition>,
}

impl PipelineOutput {
    pub fn layer(&self, name: &str) -> Option<&DerivedLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn series(&self, name: &str) -> Option<&[SeriesLayer]> {
        match name {
            DETRENDED_SERIES => Some(&self.detrended_series),
            FITTED_SERIES => Some(&self.fitted_series),
            RESIDUAL_SERIES => Some(&self.residual_series),
            INDEX_SERIES => Some(&self.index_series),
            _ => None,
        }
    }

    /// Write every layer and series to `sink`, optionally clipped; returns the number written
    pub fn export(&self, sink: &mut dyn LayerSink, clip: Option<&BoundingBox>) -> HarmonicResult<usize> {
        let prepare = |layer: &DerivedLayer| -> HarmonicResult<DerivedLayer> {
            match clip {
                Some(region) => layer.clip(region),
                None => Ok(layer.clone()),
            }
        };

        let mut written = 0;
        for layer in &self.layers {
            sink.write_layer(&prepare(layer)?)?;
            written += 1;
        }

        for name in [DETRENDED_SERIES, FITTED_SERIES, RESIDUAL_SERIES, INDEX_SERIES] {
            for entry in self.series(name).unwrap_or_default() {
                let exported = SeriesLayer {
                    layer: prepare(&entry.layer)?,
                    ..entry.clone()
                };
                sink.write_series(name, &exported)?;
                written += 1;
            }
        }

        log::info!("Exported {} layers (clipped: {})", written, clip.is_some());
        Ok(written)
    }

    /// Per-acquisition samples of one pixel, in time order
    pub fn pixel_series(&self, row: usize, col: usize) -> Vec<PixelSample> {
        self.observations
            .iter()
            .enumerate()
            .map(|(i, obs)| PixelSample {
                acquisition_id: obs.acquisition_id.clone(),
                time: obs.time,
                t: obs.t,
                observed: obs.response(row, col),
                fitted: self.fitted_series.get(i).and_then(|s| s.layer.get(row, col)),
                detrended: self.detrended_series.get(i).and_then(|s| s.layer.get(row, col)),
            })
            .collect()
    }
}

/// Latest valid index value per pixel (observations must be sorted by time)
pub fn latest_valid_mosaic(name: &str, observations: &[Observation]) -> HarmonicResult<DerivedLayer> {
    let first = observations
        .first()
        .ok_or_else(|| HarmonicError::Processing("Cannot mosaic an empty series".to_string()))?;
    Ok(DerivedLayer::from_fn(name, first.dim(), first.index.geo_transform, |r, c| {
        observations.iter().rev().find_map(|obs| obs.response(r, c))
    }))
}

/// Mean of the valid index values per pixel
pub fn temporal_mean(name: &str, observations: &[Observation]) -> HarmonicResult<DerivedLayer> {
    let first = observations
        .first()
        .ok_or_else(|| HarmonicError::Processing("Cannot average an empty series".to_string()))?;
    Ok(DerivedLayer::from_fn(name, first.dim(), first.index.geo_transform, |r, c| {
        let (sum, n) = observations
            .iter()
            .filter_map(|obs| obs.response(r, c))
            .fold((0.0, 0usize), |(sum, n), y| (sum + y, n + 1));
        (n > 0).then(|| sum / n as f64)
    }))
}

/// Runs preprocessing, both regression passes and layer derivation
pub struct HarmonicPipeline {
    config: HarmonicConfig,
    preprocessor: ObservationPreprocessor,
    trend: DesignMatrixBuilder,
    harmonic: DesignMatrixBuilder,
    deriver: PhaseAmplitudeDeriver,
}

impl HarmonicPipeline {
    /// Validate `config` and prepare the stages
    pub fn new(config: HarmonicConfig) -> HarmonicResult<Self> {
        config.validate()?;

        let preprocessor = ObservationPreprocessor::new(&config)?;
        let trend = DesignMatrixBuilder::new(RegressorSet::linear_trend(), config.fundamental_frequency)?;
        let harmonic = DesignMatrixBuilder::new(config.regressors()?, config.fundamental_frequency)?;
        let deriver = PhaseAmplitudeDeriver::new(config.amplitude_scale)?;

        Ok(Self {
            config,
            preprocessor,
            trend,
            harmonic,
            deriver,
        })
    }

    pub fn config(&self) -> &HarmonicConfig {
        &self.config
    }

    /// Fetch acquisitions from `source` and run
    pub fn run_from_source(
        &self,
        source: &mut dyn AcquisitionSource,
        filter: &AcquisitionFilter,
    ) -> HarmonicResult<PipelineOutput> {
        let acquisitions = source.fetch(filter)?;
        self.run(&acquisitions, filter)
    }

    /// Export with the configured clip region
    pub fn export(&self, output: &PipelineOutput, sink: &mut dyn LayerSink) -> HarmonicResult<usize> {
        output.export(sink, self.config.clip_region.as_ref())
    }

    pub fn run(&self, acquisitions: &[Acquisition], filter: &AcquisitionFilter) -> HarmonicResult<PipelineOutput> {
        log::info!("Starting harmonic pipeline with {} acquisitions", acquisitions.len());

        let selected: Vec<&Acquisition> = acquisitions.iter().filter(|a| filter.accepts(a)).collect();
        log::debug!(
            "Filter kept {} of {} acquisitions",
            selected.len(),
            acquisitions.len()
        );

        // Layer names are keyed by acquisition id, so only the first of a repeated id is kept
        let mut seen = HashSet::with_capacity(selected.len());
        let mut duplicates = Vec::new();
        let selected: Vec<&Acquisition> = selected
            .into_iter()
            .filter(|a| {
                let first = seen.insert(a.id.as_str());
                if !first {
                    log::warn!("Dropping acquisition '{}': id already used by an earlier acquisition", a.id);
                    duplicates.push(DroppedAcquisition {
                        acquisition_id: a.id.clone(),
                        error: HarmonicError::Processing(format!("duplicate acquisition id '{}'", a.id)),
                    });
                }
                first
            })
            .collect();

        let (mut observations, mut dropped) = self.preprocess_all(&selected);
        dropped.extend(duplicates);

        // All observations must share the first accepted grid
        if let Some(dim) = observations.first().map(|o| o.dim()) {
            let (kept, mismatched): (Vec<_>, Vec<_>) = observations.into_iter().partition(|o| o.dim() == dim);
            for obs in mismatched {
                log::warn!(
                    "Dropping acquisition '{}': grid {:?} differs from {:?}",
                    obs.acquisition_id,
                    obs.dim(),
                    dim
                );
                dropped.push(DroppedAcquisition {
                    error: HarmonicError::ShapeMismatch(format!("grid {:?} differs from {:?}", obs.dim(), dim)),
                    acquisition_id: obs.acquisition_id,
                });
            }
            observations = kept;
        }

        if observations.is_empty() {
            return Err(HarmonicError::Processing(format!(
                "No usable acquisitions ({} selected, {} dropped)",
                selected.len(),
                dropped.len()
            )));
        }

        observations.sort_by(|a, b| {
            a.time
                .cmp(&b.time)
                .then_with(|| a.acquisition_id.cmp(&b.acquisition_id))
        });
        log::info!(
            "Fitting {} observations ({} dropped) on a {}x{} grid",
            observations.len(),
            dropped.len(),
            observations[0].dim().0,
            observations[0].dim().1
        );

        let (trend, harmonic) = self.fit_passes(&observations)?;

        let mut layers = Vec::new();
        let harmonics = self.deriver.derive_all(&harmonic)?;
        for h in &harmonics {
            layers.push(h.amplitude.clone());
            layers.push(h.phase.clone());
        }

        let mosaic = latest_valid_mosaic(NDVI_MOSAIC, &observations)?;
        let mean = temporal_mean(MEAN_NDVI, &observations)?;
        let composite = match harmonics.first() {
            Some(first) => seasonality_composite(&first.phase, &first.amplitude, &mean)?.to_vec(),
            None => Vec::new(),
        };

        layers.push(mosaic);
        layers.push(mean);
        layers.push(harmonic.residual_rms_layer(RESIDUAL_RMS));
        layers.push(harmonic.observation_count_layer(OBSERVATION_COUNT));
        layers.extend(composite);

        let trend_detrender = TrendDetrender::new(trend.regressors().clone());
        let harmonic_detrender = TrendDetrender::new(harmonic.regressors().clone());

        let detrended_series = trend_detrender.series(&observations, &trend, TrendDetrender::detrended)?;
        let fitted_series = harmonic_detrender.series(&observations, &harmonic, TrendDetrender::fitted)?;
        let residual_series = harmonic_detrender.series(&observations, &harmonic, TrendDetrender::residual)?;
        let index_series = observations
            .iter()
            .map(|obs| SeriesLayer {
                acquisition_id: obs.acquisition_id.clone(),
                time: obs.time,
                t: obs.t,
                layer: obs.index.clone().renamed(INDEX_LAYER),
            })
            .collect();

        log::info!(
            "Harmonic pipeline completed: {} layers, {} series entries each",
            layers.len(),
            observations.len()
        );

        Ok(PipelineOutput {
            observations,
            trend,
            harmonic,
            layers,
            detrended_series,
            fitted_series,
            residual_series,
            index_series,
            dropped,
        })
    }

    fn preprocess_all(&self, acquisitions: &[&Acquisition]) -> (Vec<Observation>, Vec<DroppedAcquisition>) {
        #[cfg(feature = "parallel")]
        let results: Vec<(String, HarmonicResult<Observation>)> = {
            use rayon::prelude::*;
            acquisitions
                .par_iter()
                .map(|a| (a.id.clone(), self.preprocessor.preprocess(a)))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let results: Vec<(String, HarmonicResult<Observation>)> = acquisitions
            .iter()
            .map(|a| (a.id.clone(), self.preprocessor.preprocess(a)))
            .collect();

        let mut observations = Vec::with_capacity(results.len());
        let mut dropped = Vec::new();
        for (acquisition_id, result) in results {
            match result {
                Ok(obs) => observations.push(obs),
                Err(error) => {
                    log::warn!("Dropping acquisition '{}': {}", acquisition_id, error);
                    dropped.push(DroppedAcquisition { acquisition_id, error });
                }
            }
        }
        (observations, dropped)
    }

    fn solver(&self, builder: &DesignMatrixBuilder) -> PerPixelRegressionSolver {
        PerPixelRegressionSolver::new(builder.clone(), solver_for(self.config.solver))
            .with_tile_rows(self.config.tile_rows)
    }

    #[cfg(feature = "parallel")]
    fn fit_passes(&self, observations: &[Observation]) -> HarmonicResult<(CoefficientGrid, CoefficientGrid)> {
        let trend_solver = self.solver(&self.trend);
        let harmonic_solver = self.solver(&self.harmonic);
        let (trend, harmonic) = rayon::join(|| trend_solver.fit(observations), || harmonic_solver.fit(observations));
        Ok((trend?, harmonic?))
    }

    #[cfg(not(feature = "parallel"))]
    fn fit_passes(&self, observations: &[Observation]) -> HarmonicResult<(CoefficientGrid, CoefficientGrid)> {
        let trend = self.solver(&self.trend).fit(observations)?;
        let harmonic = self.solver(&self.harmonic).fit(observations)?;
        Ok((trend, harmonic))
    }
}
