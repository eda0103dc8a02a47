//! Harmonic regression engine

pub mod preprocess;
pub mod design_matrix;
pub mod regression;
pub mod detrend;
pub mod phase_amplitude;
pub mod pipeline;

// Re-export main types
pub use preprocess::{ObservationPreprocessor, Observation, RescaleRules, normalized_difference, fractional_years};
pub use design_matrix::{DesignMatrixBuilder, Regressor, RegressorSet, RegressorRow};
pub use regression::{
    PerPixelRegressionSolver, LeastSquaresSolver, QrSolver, NormalEquationsSolver, PixelSeries,
    CoefficientSet, CoefficientGrid, StatusCounts, Tile, solver_for,
};
pub use detrend::TrendDetrender;
pub use phase_amplitude::{PhaseAmplitudeDeriver, HarmonicLayers, hsv_to_rgb, seasonality_composite};
pub use pipeline::{HarmonicPipeline, PipelineOutput, PixelSample, DroppedAcquisition};
