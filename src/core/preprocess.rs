use crate::config::{HarmonicConfig, Rescale};
use crate::io::Acquisition;
use crate::types::{BandImage, DerivedLayer, HarmonicError, HarmonicResult, ValidityMask};
use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use ndarray::Zip;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

/// Name given to the vegetation index layer of every observation
pub const INDEX_LAYER: &str = "index";

/// Compiled band rescale rules.
///
/// Keys are matched as anchored regular expressions, so a plain band name
/// matches only itself and `SR_B.` matches `SR_B1`..`SR_B9`. An exact key
/// wins over patterns; among patterns the first key in lexical order wins.
#[derive(Debug, Clone, Default)]
pub struct RescaleRules {
    exact: HashMap<String, Rescale>,
    patterns: Vec<(Regex, Rescale)>,
}

impl RescaleRules {
    pub fn compile(rules: &BTreeMap<String, Rescale>) -> HarmonicResult<Self> {
        let mut compiled = RescaleRules::default();

        for (key, rescale) in rules {
            if !(rescale.scale.is_finite() && rescale.offset.is_finite()) {
                return Err(HarmonicError::InvalidConfiguration(format!(
                    "Rescale for '{}' must be finite, got {:?}",
                    key, rescale
                )));
            }

            let pattern = Regex::new(&format!("^(?:{})$", key)).map_err(|e| {
                HarmonicError::InvalidConfiguration(format!("Bad band pattern '{}': {}", key, e))
            })?;

            compiled.exact.insert(key.clone(), *rescale);
            compiled.patterns.push((pattern, *rescale));
        }

        Ok(compiled)
    }

    pub fn lookup(&self, band: &str) -> Option<Rescale> {
        if let Some(rescale) = self.exact.get(band) {
            return Some(*rescale);
        }
        self.patterns
            .iter()
            .find(|(pattern, _)| pattern.is_match(band))
            .map(|(_, rescale)| *rescale)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// A masked, rescaled acquisition with its vegetation index and time coordinate
#[derive(Debug, Clone)]
pub struct Observation {
    pub acquisition_id: String,
    pub time: DateTime<Utc>,
    /// Fractional years since the epoch
    pub t: f64,
    /// Rescaled bands
    pub bands: HashMap<String, BandImage>,
    /// Quality/saturation validity
    pub valid: ValidityMask,
    /// Vegetation index, masked where invalid or undefined
    pub index: DerivedLayer,
}

impl Observation {
    /// Observation built directly from an index raster (no band data)
    pub fn from_index(
        acquisition_id: impl Into<String>,
        time: DateTime<Utc>,
        t: f64,
        index: DerivedLayer,
    ) -> Self {
        Self {
            acquisition_id: acquisition_id.into(),
            time,
            t,
            bands: HashMap::new(),
            valid: index.valid.clone(),
            index,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.index.dim()
    }

    /// Number of pixels contributing a response value
    pub fn valid_pixel_count(&self) -> usize {
        self.index.valid_count()
    }

    pub fn response(&self, row: usize, col: usize) -> Option<f64> {
        self.index.get(row, col)
    }
}

/// Turns raw acquisitions into observations
#[derive(Debug, Clone)]
pub struct ObservationPreprocessor {
    cloud_mask_bits: u16,
    saturation_band: Option<String>,
    rescale: RescaleRules,
    numerator_band: String,
    denominator_band: String,
    epoch: NaiveDate,
}

impl ObservationPreprocessor {
    pub fn new(config: &HarmonicConfig) -> HarmonicResult<Self> {
        let (numerator_band, denominator_band) = config.index_bands.clone();
        Ok(Self {
            cloud_mask_bits: config.cloud_mask_bits,
            saturation_band: config.saturation_band.clone(),
            rescale: RescaleRules::compile(&config.band_rescale)?,
            numerator_band,
            denominator_band,
            epoch: config.epoch()?,
        })
    }

    pub fn epoch(&self) -> NaiveDate {
        self.epoch
    }

    /// Bands every acquisition must carry
    pub fn required_bands(&self) -> Vec<&str> {
        let mut bands = vec![self.numerator_band.as_str(), self.denominator_band.as_str()];
        if let Some(sat) = &self.saturation_band {
            bands.push(sat.as_str());
        }
        bands
    }

    /// Mask, rescale and compute the index for one acquisition
    pub fn preprocess(&self, acquisition: &Acquisition) -> HarmonicResult<Observation> {
        log::debug!("Preprocessing acquisition {}", acquisition.id);

        for band in self.required_bands() {
            if !acquisition.bands.contains_key(band) {
                return Err(HarmonicError::MissingRequiredBand {
                    acquisition: acquisition.id.clone(),
                    band: band.to_string(),
                });
            }
        }

        let dim = acquisition.quality.dim();
        let required = self.required_bands();
        let mut usable = HashMap::with_capacity(acquisition.bands.len());
        for (name, data) in &acquisition.bands {
            if data.dim() == dim {
                usable.insert(name.clone(), data.clone());
            } else if required.contains(&name.as_str()) || self.rescale.lookup(name).is_some() {
                return Err(HarmonicError::ShapeMismatch(format!(
                    "Acquisition '{}' band '{}' is {:?} but quality flags are {:?}",
                    acquisition.id,
                    name,
                    data.dim(),
                    dim
                )));
            } else {
                log::warn!(
                    "Acquisition '{}': ignoring band '{}' of shape {:?}, quality flags are {:?}",
                    acquisition.id,
                    name,
                    data.dim(),
                    dim
                );
            }
        }

        let valid = self.validity_mask(acquisition, &usable);
        let bands = self.rescale_bands(&usable);
        let valid = self.finite_inputs(valid, &bands);
        let index = self.compute_index(acquisition, &bands, &valid)?;
        let t = fractional_years(self.epoch, acquisition.time)?;

        log::debug!(
            "Acquisition {} at t={:.4}: {} of {} pixels valid, {} with index",
            acquisition.id,
            t,
            valid.iter().filter(|&&v| v).count(),
            valid.len(),
            index.valid_count()
        );

        Ok(Observation {
            acquisition_id: acquisition.id.clone(),
            time: acquisition.time,
            t,
            bands,
            valid,
            index,
        })
    }

    /// Apply `value * scale + offset` to every band matched by a rule
    pub fn rescale_bands(&self, bands: &HashMap<String, BandImage>) -> HashMap<String, BandImage> {
        bands
            .iter()
            .map(|(name, data)| {
                let scaled = match self.rescale.lookup(name) {
                    Some(rescale) => data.mapv(|v| rescale.apply(v)),
                    None => data.clone(),
                };
                (name.clone(), scaled)
            })
            .collect()
    }

    /// Quality bits clear and raw saturation flag zero
    fn validity_mask(&self, acquisition: &Acquisition, raw: &HashMap<String, BandImage>) -> ValidityMask {
        let bits = self.cloud_mask_bits;
        let mut valid = acquisition.quality.mapv(|q| (q & bits) == 0);

        if let Some(sat_band) = self.saturation_band.as_ref().and_then(|name| raw.get(name)) {
            Zip::from(&mut valid).and(sat_band).for_each(|v, &s| *v = *v && s == 0.0);
        }

        valid
    }

    /// Drop pixels whose rescaled index inputs are not finite
    fn finite_inputs(&self, mut valid: ValidityMask, bands: &HashMap<String, BandImage>) -> ValidityMask {
        for name in [&self.numerator_band, &self.denominator_band] {
            if let Some(data) = bands.get(name) {
                Zip::from(&mut valid).and(data).for_each(|v, &x| *v = *v && x.is_finite());
            }
        }
        valid
    }

    fn compute_index(
        &self,
        acquisition: &Acquisition,
        bands: &HashMap<String, BandImage>,
        valid: &ValidityMask,
    ) -> HarmonicResult<DerivedLayer> {
        let lookup = |name: &String| {
            bands.get(name).ok_or_else(|| HarmonicError::MissingRequiredBand {
                acquisition: acquisition.id.clone(),
                band: name.clone(),
            })
        };
        let numerator = lookup(&self.numerator_band)?;
        let denominator = lookup(&self.denominator_band)?;

        Ok(DerivedLayer::from_fn(
            INDEX_LAYER,
            valid.dim(),
            acquisition.geo_transform,
            |row, col| {
                if !valid[[row, col]] {
                    return None;
                }
                normalized_difference(numerator[[row, col]], denominator[[row, col]])
            },
        ))
    }
}

/// `(a - b) / (a + b)`, undefined where the sum is zero or an input is not finite
pub fn normalized_difference(a: f64, b: f64) -> Option<f64> {
    if !(a.is_finite() && b.is_finite()) {
        return None;
    }
    let sum = a + b;
    if sum == 0.0 {
        return None;
    }
    Some((a - b) / sum)
}

/// Fractional years from `epoch` (midnight UTC) to `time`.
///
/// Whole years are counted in anniversaries of the epoch; the remainder is
/// divided by the length of the year it falls in (365 or 366 days).
pub fn fractional_years(epoch: NaiveDate, time: DateTime<Utc>) -> HarmonicResult<f64> {
    let out_of_range = || {
        HarmonicError::Processing(format!(
            "Cannot express {} relative to epoch {}",
            time, epoch
        ))
    };

    let anniversary = |years: i32| -> HarmonicResult<DateTime<Utc>> {
        let months = years
            .unsigned_abs()
            .checked_mul(12)
            .map(Months::new)
            .ok_or_else(out_of_range)?;
        let date = if years >= 0 {
            epoch.checked_add_months(months)
        } else {
            epoch.checked_sub_months(months)
        };
        date.and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .ok_or_else(out_of_range)
    };

    let mut years = time.year() - epoch.year();
    loop {
        let start = anniversary(years)?;
        if start > time {
            years -= 1;
            continue;
        }
        let end = anniversary(years + 1)?;
        if end <= time {
            years += 1;
            continue;
        }

        let elapsed = (time - start).num_milliseconds() as f64;
        let length = (end - start).num_milliseconds() as f64;
        return Ok(years as f64 + elapsed / length);
    }
}
