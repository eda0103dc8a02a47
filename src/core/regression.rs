use crate::config::SolverKind;
use crate::core::design_matrix::{DesignMatrixBuilder, Regressor, RegressorRow, RegressorSet};
use crate::core::preprocess::Observation;
use crate::types::{DerivedLayer, FitFailure, GeoTransform, HarmonicError, HarmonicResult, PixelStatus};
use nalgebra::{DMatrix, DVector};
use ndarray::{s, Array1, Array2, Array3, ArrayView1};

/// |R_jj| / ||x_j|| below this marks a rank-deficient design (QR backend)
const QR_RANK_TOLERANCE: f64 = 1e-10;

/// L_jj² / (XᵗX)_jj below this marks a rank-deficient design (Cholesky backend)
const CHOLESKY_PIVOT_TOLERANCE: f64 = 1e-12;

/// Default number of raster rows per regression tile
pub const DEFAULT_TILE_ROWS: usize = 64;

/// Valid design rows and responses of a single pixel, in time order
#[derive(Debug, Clone)]
pub struct PixelSeries {
    design: Array2<f64>,
    response: Array1<f64>,
}

impl PixelSeries {
    pub fn new(design: Array2<f64>, response: Array1<f64>) -> HarmonicResult<Self> {
        if design.nrows() != response.len() {
            return Err(HarmonicError::ShapeMismatch(format!(
                "Design matrix has {} rows but response has {} values",
                design.nrows(),
                response.len()
            )));
        }
        Ok(Self { design, response })
    }

    /// Stack the rows of every observation with a valid response at (row, col)
    pub fn gather(
        observations: &[Observation],
        rows: &[RegressorRow],
        row: usize,
        col: usize,
    ) -> HarmonicResult<Self> {
        let k = rows.first().map(|r| r.values.len()).unwrap_or(0);
        let mut design = Vec::with_capacity(rows.len() * k);
        let mut response = Vec::with_capacity(rows.len());

        for (obs, regressor_row) in observations.iter().zip(rows) {
            if let Some(y) = obs.response(row, col) {
                design.extend_from_slice(&regressor_row.values);
                response.push(y);
            }
        }

        let n = response.len();
        let design = Array2::from_shape_vec((n, k), design)
            .map_err(|e| HarmonicError::ShapeMismatch(format!("Pixel ({}, {}): {}", row, col, e)))?;
        Self::new(design, Array1::from(response))
    }

    /// Number of valid observations
    pub fn len(&self) -> usize {
        self.response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.response.is_empty()
    }

    pub fn regressor_count(&self) -> usize {
        self.design.ncols()
    }

    pub fn design(&self) -> &Array2<f64> {
        &self.design
    }

    pub fn response(&self) -> &Array1<f64> {
        &self.response
    }

    /// `Σ (y_i − x_i·c)²`
    pub fn residual_sum_of_squares(&self, coefficients: &[f64]) -> f64 {
        let fitted = self.design.dot(&ArrayView1::from(coefficients));
        self.response
            .iter()
            .zip(fitted.iter())
            .map(|(y, f)| (y - f) * (y - f))
            .sum()
    }

    fn to_nalgebra(&self) -> (DMatrix<f64>, DVector<f64>) {
        let (n, k) = self.design.dim();
        let x = DMatrix::from_fn(n, k, |i, j| self.design[[i, j]]);
        let y = DVector::from_iterator(n, self.response.iter().copied());
        (x, y)
    }

    fn check_sample_size(&self) -> HarmonicResult<()> {
        if self.len() < self.regressor_count() {
            return Err(HarmonicError::InsufficientData {
                valid: self.len(),
                required: self.regressor_count(),
            });
        }
        Ok(())
    }
}

/// Least-squares solution for one pixel
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientSet {
    /// One coefficient per regressor, in regressor-set order
    pub coefficients: Vec<f64>,
    /// Residual sum of squares
    pub rss: f64,
    /// Number of observations used
    pub observations: usize,
}

impl CoefficientSet {
    pub fn predict(&self, row: &RegressorRow) -> f64 {
        row.dot(&self.coefficients)
    }

    pub fn rms_residual(&self) -> f64 {
        if self.observations == 0 {
            return f64::NAN;
        }
        (self.rss / self.observations as f64).sqrt()
    }
}

/// Backend that solves `min ||y − X c||²` for one pixel.
///
/// Implementations return `InsufficientData` or `SingularDesign` for
/// unsolvable pixels; any other error fails the whole tile.
pub trait LeastSquaresSolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(&self, series: &PixelSeries) -> HarmonicResult<CoefficientSet>;
}

fn finish(series: &PixelSeries, coefficients: Vec<f64>) -> HarmonicResult<CoefficientSet> {
    if coefficients.iter().any(|c| !c.is_finite()) {
        return Err(HarmonicError::SingularDesign);
    }
    let rss = series.residual_sum_of_squares(&coefficients);
    Ok(CoefficientSet {
        coefficients,
        rss,
        observations: series.len(),
    })
}

/// Householder QR of the design matrix
#[derive(Debug, Clone, Copy, Default)]
pub struct QrSolver;

impl LeastSquaresSolver for QrSolver {
    fn name(&self) -> &'static str {
        "qr"
    }

    fn solve(&self, series: &PixelSeries) -> HarmonicResult<CoefficientSet> {
        series.check_sample_size()?;

        let (x, y) = series.to_nalgebra();
        let column_norms: Vec<f64> = x.column_iter().map(|c| c.norm()).collect();

        let qr = x.qr();
        let r = qr.r();
        for (j, &norm) in column_norms.iter().enumerate() {
            if norm == 0.0 || r[(j, j)].abs() / norm < QR_RANK_TOLERANCE {
                return Err(HarmonicError::SingularDesign);
            }
        }

        let qty = qr.q().transpose() * &y;
        let c = r
            .solve_upper_triangular(&qty)
            .ok_or(HarmonicError::SingularDesign)?;

        finish(series, c.iter().copied().collect())
    }
}

/// Cholesky solve of the normal equations `(XᵗX) c = Xᵗy`
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalEquationsSolver;

impl LeastSquaresSolver for NormalEquationsSolver {
    fn name(&self) -> &'static str {
        "normal-equations"
    }

    fn solve(&self, series: &PixelSeries) -> HarmonicResult<CoefficientSet> {
        series.check_sample_size()?;

        let (x, y) = series.to_nalgebra();
        let xt = x.transpose();
        let xtx = &xt * &x;
        let xty = &xt * &y;
        let diagonal: Vec<f64> = (0..xtx.ncols()).map(|j| xtx[(j, j)]).collect();

        let cholesky = xtx.cholesky().ok_or(HarmonicError::SingularDesign)?;
        let l = cholesky.l();
        for (j, &d) in diagonal.iter().enumerate() {
            let pivot = l[(j, j)] * l[(j, j)];
            if d <= 0.0 || pivot / d < CHOLESKY_PIVOT_TOLERANCE {
                return Err(HarmonicError::SingularDesign);
            }
        }

        let c = cholesky.solve(&xty);
        finish(series, c.iter().copied().collect())
    }
}

/// Backend for a configured solver kind
pub fn solver_for(kind: SolverKind) -> Box<dyn LeastSquaresSolver> {
    match kind {
        SolverKind::Qr => Box::new(QrSolver),
        SolverKind::NormalEquations => Box::new(NormalEquationsSolver),
    }
}

/// A block of raster cells solved by one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row_offset: usize,
    pub col_offset: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Tile {
    pub fn new(row_offset: usize, col_offset: usize, rows: usize, cols: usize) -> Self {
        Self {
            row_offset,
            col_offset,
            rows,
            cols,
        }
    }

    /// Convert tile-local coordinates to grid coordinates
    pub fn to_source_coords(&self, local_row: usize, local_col: usize) -> (usize, usize) {
        (self.row_offset + local_row, self.col_offset + local_col)
    }
}

/// Full-width row tiles covering a `total_rows x total_cols` grid
pub fn row_tiles(total_rows: usize, total_cols: usize, tile_rows: usize) -> Vec<Tile> {
    let tile_rows = tile_rows.max(1);
    (0..total_rows)
        .step_by(tile_rows)
        .map(|start| Tile::new(start, 0, tile_rows.min(total_rows - start), total_cols))
        .collect()
}

/// Pixel counts per regression outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub solved: usize,
    pub insufficient_data: usize,
    pub singular_design: usize,
    pub unprocessed: usize,
}

/// Per-pixel regression results for a whole raster
#[derive(Debug, Clone)]
pub struct CoefficientGrid {
    builder: DesignMatrixBuilder,
    coefficients: Array3<f64>,
    rss: Array2<f64>,
    observations: Array2<usize>,
    status: Array2<PixelStatus>,
    geo_transform: Option<GeoTransform>,
    failed_tiles: Vec<Tile>,
}

impl CoefficientGrid {
    fn empty(builder: DesignMatrixBuilder, dim: (usize, usize), geo_transform: Option<GeoTransform>) -> Self {
        let k = builder.regressors().len();
        Self {
            builder,
            coefficients: Array3::from_elem((dim.0, dim.1, k), f64::NAN),
            rss: Array2::from_elem(dim, f64::NAN),
            observations: Array2::zeros(dim),
            status: Array2::from_elem(dim, PixelStatus::Unprocessed),
            geo_transform,
            failed_tiles: Vec::new(),
        }
    }

    fn merge(&mut self, fit: TileFit) {
        let t = fit.tile;
        let rows = t.row_offset..t.row_offset + t.rows;
        let cols = t.col_offset..t.col_offset + t.cols;

        self.coefficients
            .slice_mut(s![rows.clone(), cols.clone(), ..])
            .assign(&fit.coefficients);
        self.rss.slice_mut(s![rows.clone(), cols.clone()]).assign(&fit.rss);
        self.observations
            .slice_mut(s![rows.clone(), cols.clone()])
            .assign(&fit.observations);
        self.status.slice_mut(s![rows, cols]).assign(&fit.status);
    }

    pub fn regressors(&self) -> &RegressorSet {
        self.builder.regressors()
    }

    /// Builder that produced the design rows of this fit
    pub fn builder(&self) -> &DesignMatrixBuilder {
        &self.builder
    }

    pub fn dim(&self) -> (usize, usize) {
        self.status.dim()
    }

    pub fn geo_transform(&self) -> Option<GeoTransform> {
        self.geo_transform
    }

    /// Tiles whose solve failed; their pixels are `Unprocessed`
    pub fn failed_tiles(&self) -> &[Tile] {
        &self.failed_tiles
    }

    pub fn status(&self, row: usize, col: usize) -> PixelStatus {
        self.status
            .get((row, col))
            .copied()
            .unwrap_or(PixelStatus::Unprocessed)
    }

    pub fn status_raster(&self) -> &Array2<PixelStatus> {
        &self.status
    }

    /// Raw (rows, cols, regressors) coefficient cube, `NaN` where unsolved
    pub fn coefficients(&self) -> &Array3<f64> {
        &self.coefficients
    }

    pub fn coefficient_set(&self, row: usize, col: usize) -> Option<CoefficientSet> {
        if self.status(row, col) != PixelStatus::Solved {
            return None;
        }
        Some(CoefficientSet {
            coefficients: self.coefficients.slice(s![row, col, ..]).to_vec(),
            rss: self.rss[[row, col]],
            observations: self.observations[[row, col]],
        })
    }

    /// Model value `x·c` at a solved pixel
    pub fn predict(&self, row: usize, col: usize, regressors: &RegressorRow) -> Option<f64> {
        if self.status(row, col) != PixelStatus::Solved {
            return None;
        }
        let c = self.coefficients.slice(s![row, col, ..]);
        Some(regressors.values.iter().zip(c.iter()).map(|(x, c)| x * c).sum())
    }

    pub fn coefficient(&self, row: usize, col: usize, regressor: &Regressor) -> Option<f64> {
        let j = self.regressors().position(regressor)?;
        if self.status(row, col) != PixelStatus::Solved {
            return None;
        }
        Some(self.coefficients[[row, col, j]])
    }

    /// One coefficient as a raster (the `arrayFlatten` view of the fit)
    pub fn coefficient_layer(&self, regressor: &Regressor) -> HarmonicResult<DerivedLayer> {
        let j = self.regressors().position(regressor).ok_or_else(|| {
            HarmonicError::InvalidConfiguration(format!(
                "Regressor '{}' is not part of {:?}",
                regressor,
                self.regressors().names()
            ))
        })?;

        Ok(DerivedLayer::from_fn(
            regressor.to_string(),
            self.dim(),
            self.geo_transform,
            |row, col| match self.status[[row, col]] {
                PixelStatus::Solved => Some(self.coefficients[[row, col, j]]),
                _ => None,
            },
        ))
    }

    /// Root-mean-square residual `sqrt(RSS / n)` of solved pixels
    pub fn residual_rms_layer(&self, name: &str) -> DerivedLayer {
        DerivedLayer::from_fn(name, self.dim(), self.geo_transform, |row, col| {
            match self.status[[row, col]] {
                PixelStatus::Solved => {
                    let n = self.observations[[row, col]];
                    Some((self.rss[[row, col]] / n as f64).sqrt())
                }
                _ => None,
            }
        })
    }

    /// Valid observations per pixel, defined wherever the pixel was processed
    pub fn observation_count_layer(&self, name: &str) -> DerivedLayer {
        DerivedLayer::from_fn(name, self.dim(), self.geo_transform, |row, col| {
            match self.status[[row, col]] {
                PixelStatus::Unprocessed => None,
                _ => Some(self.observations[[row, col]] as f64),
            }
        })
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for status in self.status.iter() {
            match status {
                PixelStatus::Solved => counts.solved += 1,
                PixelStatus::InsufficientData => counts.insufficient_data += 1,
                PixelStatus::SingularDesign => counts.singular_design += 1,
                PixelStatus::Unprocessed => counts.unprocessed += 1,
            }
        }
        counts
    }
}

/// Results of one tile, written back into the grid after all tiles finish
struct TileFit {
    tile: Tile,
    coefficients: Array3<f64>,
    rss: Array2<f64>,
    observations: Array2<usize>,
    status: Array2<PixelStatus>,
}

impl TileFit {
    fn new(tile: Tile, k: usize) -> Self {
        let dim = (tile.rows, tile.cols);
        Self {
            tile,
            coefficients: Array3::from_elem((dim.0, dim.1, k), f64::NAN),
            rss: Array2::from_elem(dim, f64::NAN),
            observations: Array2::zeros(dim),
            status: Array2::from_elem(dim, PixelStatus::Unprocessed),
        }
    }
}

/// Ordinary least squares per pixel across the time dimension
pub struct PerPixelRegressionSolver {
    builder: DesignMatrixBuilder,
    backend: Box<dyn LeastSquaresSolver>,
    tile_rows: usize,
}

impl PerPixelRegressionSolver {
    pub fn new(builder: DesignMatrixBuilder, backend: Box<dyn LeastSquaresSolver>) -> Self {
        Self {
            builder,
            backend,
            tile_rows: DEFAULT_TILE_ROWS,
        }
    }

    pub fn with_tile_rows(mut self, tile_rows: usize) -> Self {
        self.tile_rows = tile_rows.max(1);
        self
    }

    pub fn regressors(&self) -> &RegressorSet {
        self.builder.regressors()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Fit every pixel of the observation stack
    pub fn fit(&self, observations: &[Observation]) -> HarmonicResult<CoefficientGrid> {
        let first = observations.first().ok_or_else(|| {
            HarmonicError::Processing("No observations available for regression".to_string())
        })?;
        let dim = first.dim();

        for obs in observations {
            if obs.dim() != dim {
                return Err(HarmonicError::ShapeMismatch(format!(
                    "Observation '{}' is {:?}, expected {:?}",
                    obs.acquisition_id,
                    obs.dim(),
                    dim
                )));
            }
        }

        log::info!(
            "Fitting {:?} over {} observations on a {}x{} grid ({} backend)",
            self.regressors().names(),
            observations.len(),
            dim.0,
            dim.1,
            self.backend.name()
        );

        let rows = self.builder.rows(observations);
        let tiles = row_tiles(dim.0, dim.1, self.tile_rows);
        log::debug!("Solving {} tiles of up to {} rows", tiles.len(), self.tile_rows);

        let mut grid = CoefficientGrid::empty(self.builder.clone(), dim, first.index.geo_transform);
        for (tile, fit) in self.fit_tiles(&tiles, observations, &rows) {
            match fit {
                Ok(fit) => grid.merge(fit),
                Err(e) => {
                    log::warn!(
                        "Tile at row {} ({} rows) failed, pixels left unprocessed: {}",
                        tile.row_offset,
                        tile.rows,
                        e
                    );
                    grid.failed_tiles.push(tile);
                }
            }
        }

        let counts = grid.status_counts();
        log::info!(
            "Regression completed: {} solved, {} insufficient data, {} singular, {} unprocessed",
            counts.solved,
            counts.insufficient_data,
            counts.singular_design,
            counts.unprocessed
        );
        Ok(grid)
    }

    /// Fit a single pixel
    pub fn fit_pixel(
        &self,
        observations: &[Observation],
        row: usize,
        col: usize,
    ) -> HarmonicResult<CoefficientSet> {
        let rows = self.builder.rows(observations);
        let series = PixelSeries::gather(observations, &rows, row, col)?;
        self.solve_series(&series)
    }

    fn solve_series(&self, series: &PixelSeries) -> HarmonicResult<CoefficientSet> {
        let k = self.regressors().len();
        if series.len() < k {
            return Err(FitFailure::InsufficientData {
                valid: series.len(),
                required: k,
            }
            .into());
        }
        self.backend.solve(series)
    }

    fn fit_tile(
        &self,
        tile: Tile,
        observations: &[Observation],
        rows: &[RegressorRow],
    ) -> HarmonicResult<TileFit> {
        let mut fit = TileFit::new(tile, self.regressors().len());

        for local_row in 0..tile.rows {
            for local_col in 0..tile.cols {
                let (row, col) = tile.to_source_coords(local_row, local_col);
                let series = PixelSeries::gather(observations, rows, row, col)?;
                let cell = [local_row, local_col];
                fit.observations[cell] = series.len();

                match self.solve_series(&series) {
                    Ok(set) => {
                        fit.coefficients
                            .slice_mut(s![local_row, local_col, ..])
                            .assign(&ArrayView1::from(&set.coefficients[..]));
                        fit.rss[cell] = set.rss;
                        fit.status[cell] = PixelStatus::Solved;
                    }
                    Err(HarmonicError::InsufficientData { valid, required }) => {
                        fit.status[cell] = FitFailure::InsufficientData { valid, required }.into();
                    }
                    Err(HarmonicError::SingularDesign) => {
                        fit.status[cell] = FitFailure::SingularDesign.into();
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(fit)
    }

    #[cfg(feature = "parallel")]
    fn fit_tiles(
        &self,
        tiles: &[Tile],
        observations: &[Observation],
        rows: &[RegressorRow],
    ) -> Vec<(Tile, HarmonicResult<TileFit>)> {
        use rayon::prelude::*;

        tiles
            .par_iter()
            .map(|&tile| (tile, self.fit_tile(tile, observations, rows)))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn fit_tiles(
        &self,
        tiles: &[Tile],
        observations: &[Observation],
        rows: &[RegressorRow],
    ) -> Vec<(Tile, HarmonicResult<TileFit>)> {
        tiles
            .iter()
            .map(|&tile| (tile, self.fit_tile(tile, observations, rows)))
            .collect()
    }
}
