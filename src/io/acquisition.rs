use crate::types::{BandImage, BoundingBox, GeoTransform, HarmonicResult, QualityImage};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

/// One timestamped multi-band raster capture on a common pixel grid
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub id: String,
    pub time: DateTime<Utc>,
    pub bands: HashMap<String, BandImage>,
    /// Per-pixel quality flags (bit field)
    pub quality: QualityImage,
    pub geo_transform: Option<GeoTransform>,
}

impl Acquisition {
    pub fn new(id: impl Into<String>, time: DateTime<Utc>, quality: QualityImage) -> Self {
        Self {
            id: id.into(),
            time,
            bands: HashMap::new(),
            quality,
            geo_transform: None,
        }
    }

    pub fn with_band(mut self, name: impl Into<String>, data: BandImage) -> Self {
        self.bands.insert(name.into(), data);
        self
    }

    pub fn with_geo_transform(mut self, geo_transform: GeoTransform) -> Self {
        self.geo_transform = Some(geo_transform);
        self
    }

    /// Grid shape (rows, cols), taken from the quality flags
    pub fn dim(&self) -> (usize, usize) {
        self.quality.dim()
    }

    /// Spatial extent, if the acquisition is georeferenced
    pub fn footprint(&self) -> Option<BoundingBox> {
        let (rows, cols) = self.dim();
        self.geo_transform.map(|gt| gt.footprint(rows, cols))
    }
}

/// Spatial and temporal selection applied before preprocessing
#[derive(Debug, Clone, Default)]
pub struct AcquisitionFilter {
    pub region: Option<BoundingBox>,
    /// First accepted date (inclusive)
    pub start: Option<NaiveDate>,
    /// Last accepted date (inclusive)
    pub end: Option<NaiveDate>,
}

impl AcquisitionFilter {
    /// Accept everything
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            region: None,
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn with_region(mut self, region: BoundingBox) -> Self {
        self.region = Some(region);
        self
    }

    /// Date within `[start, end]` and footprint intersecting the region.
    ///
    /// Acquisitions without a geotransform cannot be located and pass the
    /// spatial test.
    pub fn accepts(&self, acquisition: &Acquisition) -> bool {
        let date = acquisition.time.date_naive();
        if matches!(self.start, Some(start) if date < start) {
            return false;
        }
        if matches!(self.end, Some(end) if date > end) {
            return false;
        }

        match (&self.region, acquisition.footprint()) {
            (Some(region), Some(footprint)) => region.intersects(&footprint),
            _ => true,
        }
    }
}

/// Supplier of raw acquisitions (catalog, archive reader, test fixture)
pub trait AcquisitionSource {
    /// Acquisitions matching `filter`; sources may over-deliver, the pipeline re-filters
    fn fetch(&mut self, filter: &AcquisitionFilter) -> HarmonicResult<Vec<Acquisition>>;
}

/// Acquisitions already held in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    acquisitions: Vec<Acquisition>,
}

impl MemorySource {
    pub fn new(acquisitions: Vec<Acquisition>) -> Self {
        Self { acquisitions }
    }

    pub fn push(&mut self, acquisition: Acquisition) {
        self.acquisitions.push(acquisition);
    }

    pub fn len(&self) -> usize {
        self.acquisitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acquisitions.is_empty()
    }
}

impl AcquisitionSource for MemorySource {
    fn fetch(&mut self, filter: &AcquisitionFilter) -> HarmonicResult<Vec<Acquisition>> {
        let selected: Vec<Acquisition> = self
            .acquisitions
            .iter()
            .filter(|a| filter.accepts(a))
            .cloned()
            .collect();
        log::debug!(
            "Memory source returned {} of {} acquisitions",
            selected.len(),
            self.acquisitions.len()
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::Array2;

    fn acq(id: &str, y: i32, m: u32, d: u32) -> Acquisition {
        Acquisition::new(id, Utc.with_ymd_and_hms(y, m, d, 10, 30, 0).unwrap(), Array2::zeros((2, 2)))
            .with_geo_transform(GeoTransform::north_up(51.0, 36.0, 0.01, -0.01))
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let filter = AcquisitionFilter::between(
            NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 12, 31).unwrap(),
        );
        assert!(filter.accepts(&acq("first", 2014, 1, 1)));
        assert!(filter.accepts(&acq("last", 2021, 12, 31)));
        assert!(!filter.accepts(&acq("early", 2013, 12, 31)));
        assert!(!filter.accepts(&acq("late", 2022, 1, 1)));
    }

    #[test]
    fn test_region_filter() {
        let inside = AcquisitionFilter::all().with_region(BoundingBox::new(51.0, 35.9, 51.1, 36.1));
        let outside = AcquisitionFilter::all().with_region(BoundingBox::new(43.0, 24.0, 44.0, 25.0));
        assert!(inside.accepts(&acq("a", 2020, 1, 1)));
        assert!(!outside.accepts(&acq("a", 2020, 1, 1)));

        let unplaced = Acquisition::new("u", Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(), Array2::zeros((1, 1)));
        assert!(outside.accepts(&unplaced));
    }

    #[test]
    fn test_memory_source_applies_filter() {
        let mut source = MemorySource::new(vec![acq("a", 2015, 6, 1), acq("b", 2023, 6, 1)]);
        let filter = AcquisitionFilter::between(
            NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 12, 31).unwrap(),
        );
        let fetched = source.fetch(&filter).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, "a");
    }
}
