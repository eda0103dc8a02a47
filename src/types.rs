use chrono::{DateTime, Utc};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Per-pixel reflectance or index values on the acquisition grid (rows x cols)
pub type BandImage = Array2<f64>;

/// Per-pixel quality flags (e.g. Landsat `QA_PIXEL`)
pub type QualityImage = Array2<u16>;

/// Per-pixel validity, `true` where a value may be read
pub type ValidityMask = Array2<bool>;

/// Geospatial bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
        }
    }

    /// Whether the box has a non-negative extent on both axes
    pub fn is_valid(&self) -> bool {
        self.min_lon <= self.max_lon && self.min_lat <= self.max_lat
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    /// Closed-interval overlap test (touching boxes intersect)
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }
}

/// Geospatial transformation parameters (GDAL affine convention)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation terms
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height,
        }
    }

    /// Map fractional pixel coordinates to (x, y)
    pub fn apply(&self, row: f64, col: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    /// Coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.apply(row as f64 + 0.5, col as f64 + 0.5)
    }

    /// Bounding box of a `rows x cols` grid placed by this transform
    pub fn footprint(&self, rows: usize, cols: usize) -> BoundingBox {
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(0.0, cols as f64),
            self.apply(rows as f64, 0.0),
            self.apply(rows as f64, cols as f64),
        ];

        let mut bbox = BoundingBox::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            bbox.min_lon = bbox.min_lon.min(x);
            bbox.max_lon = bbox.max_lon.max(x);
            bbox.min_lat = bbox.min_lat.min(y);
            bbox.max_lat = bbox.max_lat.max(y);
        }
        bbox
    }
}

/// Per-pixel scalar raster with an explicit validity mask.
///
/// Pixels flagged invalid always hold `NaN` in `values`; consumers must
/// check `valid` (or use [`DerivedLayer::get`]) before reading a value.
#[derive(Debug, Clone)]
pub struct DerivedLayer {
    pub name: String,
    pub values: BandImage,
    pub valid: ValidityMask,
    pub geo_transform: Option<GeoTransform>,
}

impl DerivedLayer {
    /// Build a layer, forcing `NaN` under the invalid part of the mask
    pub fn new(
        name: impl Into<String>,
        mut values: BandImage,
        valid: ValidityMask,
        geo_transform: Option<GeoTransform>,
    ) -> HarmonicResult<Self> {
        let name = name.into();
        if values.dim() != valid.dim() {
            return Err(HarmonicError::ShapeMismatch(format!(
                "Layer '{}' values {:?} do not match validity mask {:?}",
                name,
                values.dim(),
                valid.dim()
            )));
        }

        Zip::from(&mut values).and(&valid).for_each(|v, &ok| {
            if !ok {
                *v = f64::NAN;
            }
        });

        Ok(Self {
            name,
            values,
            valid,
            geo_transform,
        })
    }

    /// Build a layer from a per-pixel closure; `None` marks the pixel invalid.
    ///
    /// Pixels are evaluated independently (in parallel with the `parallel` feature).
    pub fn from_fn<F>(
        name: impl Into<String>,
        dim: (usize, usize),
        geo_transform: Option<GeoTransform>,
        f: F,
    ) -> Self
    where
        F: Fn(usize, usize) -> Option<f64> + Sync + Send,
    {
        let mut cells: Array2<Option<f64>> = Array2::from_elem(dim, None);

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut cells).par_for_each(|(row, col), cell| *cell = f(row, col));

        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut cells).for_each(|(row, col), cell| *cell = f(row, col));

        Self::from_cells(name, &cells, geo_transform)
    }

    fn from_cells(
        name: impl Into<String>,
        cells: &Array2<Option<f64>>,
        geo_transform: Option<GeoTransform>,
    ) -> Self {
        // A finite check keeps NaN/inf out of the valid set
        let valid = cells.mapv(|c| matches!(c, Some(v) if v.is_finite()));
        let values = Zip::from(cells).and(&valid).map_collect(|c, &ok| match c {
            Some(v) if ok => *v,
            _ => f64::NAN,
        });

        Self {
            name: name.into(),
            values,
            valid,
            geo_transform,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    /// Value at (row, col), `None` when masked or out of bounds
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        match self.valid.get((row, col)) {
            Some(true) => self.values.get((row, col)).copied(),
            _ => None,
        }
    }

    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.valid.get((row, col)).copied().unwrap_or(false)
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Minimum and maximum over valid pixels
    pub fn valid_range(&self) -> Option<(f64, f64)> {
        Zip::from(&self.values)
            .and(&self.valid)
            .fold(None, |acc: Option<(f64, f64)>, &v, &ok| {
                if !ok {
                    return acc;
                }
                Some(match acc {
                    Some((lo, hi)) => (lo.min(v), hi.max(v)),
                    None => (v, v),
                })
            })
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mask every pixel whose centre falls outside `region`
    pub fn clip(&self, region: &BoundingBox) -> HarmonicResult<Self> {
        let transform = self.geo_transform.ok_or_else(|| {
            HarmonicError::Processing(format!(
                "Layer '{}' has no geotransform and cannot be clipped",
                self.name
            ))
        })?;

        let mut clipped = self.clone();
        Zip::indexed(&mut clipped.values)
            .and(&mut clipped.valid)
            .for_each(|(row, col), v, ok| {
                let (x, y) = transform.pixel_center(row, col);
                if !region.contains(x, y) {
                    *v = f64::NAN;
                    *ok = false;
                }
            });

        log::debug!(
            "Clipped layer '{}': {} of {} pixels remain valid",
            self.name,
            clipped.valid_count(),
            self.valid_count()
        );
        Ok(clipped)
    }
}

/// A derived layer tied to one acquisition of the time series
#[derive(Debug, Clone)]
pub struct SeriesLayer {
    pub acquisition_id: String,
    pub time: DateTime<Utc>,
    /// Time coordinate in fractional years since the epoch
    pub t: f64,
    pub layer: DerivedLayer,
}

/// Why a pixel has no coefficient set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitFailure {
    /// Fewer valid observations than regressors
    InsufficientData { valid: usize, required: usize },
    /// Degenerate (rank-deficient) design matrix
    SingularDesign,
}

/// Per-pixel outcome of a regression pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelStatus {
    /// Pixel belongs to a tile that failed; no result
    #[default]
    Unprocessed,
    Solved,
    InsufficientData,
    SingularDesign,
}

impl From<FitFailure> for PixelStatus {
    fn from(failure: FitFailure) -> Self {
        match failure {
            FitFailure::InsufficientData { .. } => PixelStatus::InsufficientData,
            FitFailure::SingularDesign => PixelStatus::SingularDesign,
        }
    }
}

/// Error types for harmonic processing
#[derive(Debug, thiserror::Error)]
pub enum HarmonicError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Acquisition '{acquisition}' is missing required band '{band}'")]
    MissingRequiredBand { acquisition: String, band: String },

    #[error("Insufficient data: {valid} valid observations for {required} regressors")]
    InsufficientData { valid: usize, required: usize },

    #[error("Singular design matrix")]
    SingularDesign,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl From<FitFailure> for HarmonicError {
    fn from(failure: FitFailure) -> Self {
        match failure {
            FitFailure::InsufficientData { valid, required } => {
                HarmonicError::InsufficientData { valid, required }
            }
            FitFailure::SingularDesign => HarmonicError::SingularDesign,
        }
    }
}

/// Result type for harmonic processing
pub type HarmonicResult<T> = Result<T, HarmonicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_masks_values() {
        let values = Array2::from_elem((2, 2), 1.0);
        let mut valid = Array2::from_elem((2, 2), true);
        valid[[0, 1]] = false;

        let layer = DerivedLayer::new("x", values, valid, None).unwrap();
        assert!(layer.values[[0, 1]].is_nan());
        assert_eq!(layer.get(0, 1), None);
        assert_eq!(layer.get(1, 1), Some(1.0));
        assert_eq!(layer.get(5, 5), None);
        assert_eq!(layer.valid_count(), 3);
    }

    #[test]
    fn test_from_fn_rejects_non_finite() {
        let layer = DerivedLayer::from_fn("x", (1, 3), None, |_, col| match col {
            0 => Some(0.5),
            1 => Some(f64::NAN),
            _ => None,
        });
        assert_eq!(layer.valid_count(), 1);
        assert_eq!(layer.valid_range(), Some((0.5, 0.5)));
    }

    #[test]
    fn test_footprint_and_clip() {
        // 4x4 grid of 1-degree pixels from (10, 50) going south-east
        let gt = GeoTransform::north_up(10.0, 50.0, 1.0, -1.0);
        let bbox = gt.footprint(4, 4);
        assert_eq!(bbox, BoundingBox::new(10.0, 46.0, 14.0, 50.0));

        let layer = DerivedLayer::from_fn("x", (4, 4), Some(gt), |_, _| Some(1.0));
        let clipped = layer.clip(&BoundingBox::new(10.0, 48.0, 12.0, 50.0)).unwrap();
        assert_eq!(clipped.valid_count(), 4);
        assert!(clipped.is_valid(0, 0));
        assert!(clipped.is_valid(1, 1));
        assert!(!clipped.is_valid(2, 0));
        assert!(!clipped.is_valid(0, 2));
    }

    #[test]
    fn test_clip_without_transform_fails() {
        let layer = DerivedLayer::from_fn("x", (2, 2), None, |_, _| Some(1.0));
        assert!(layer.clip(&BoundingBox::new(0.0, 0.0, 1.0, 1.0)).is_err());
    }

    #[test]
    fn test_bbox_intersects() {
        let a = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
        assert!(a.intersects(&BoundingBox::new(2.0, 2.0, 3.0, 3.0)));
        assert!(!a.intersects(&BoundingBox::new(2.5, 0.0, 3.0, 1.0)));
    }
}
