//! Run configuration for the harmonic pipeline
//!
//! The configuration is plain serde data (camelCase JSON) and is validated
//! once, before any acquisition is touched.

use crate::core::design_matrix::{Regressor, RegressorSet, MAX_HARMONIC_ORDER};
use crate::core::preprocess::RescaleRules;
use crate::types::{BoundingBox, HarmonicError, HarmonicResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Linear radiometric rescale `value * scale + offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rescale {
    pub scale: f64,
    pub offset: f64,
}

impl Rescale {
    pub fn new(scale: f64, offset: f64) -> Self {
        Self { scale, offset }
    }

    pub fn apply(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }
}

/// Least-squares backend used by both regression passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SolverKind {
    /// Householder QR of the design matrix
    #[default]
    Qr,
    /// Cholesky factorisation of `XᵗX`
    NormalEquations,
}

/// Complete configuration of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarmonicConfig {
    /// Quality-flag bits that invalidate a pixel when any is set
    #[serde(default)]
    pub cloud_mask_bits: u16,
    /// Band that must be zero for a pixel to be valid
    #[serde(default)]
    pub saturation_band: Option<String>,
    /// Band name (or anchored regex) to rescale factors
    #[serde(default)]
    pub band_rescale: BTreeMap<String, Rescale>,
    /// (numerator, denominator) bands of the normalized difference
    pub index_bands: (String, String),
    /// Origin of the time coordinate
    #[serde(default)]
    pub epoch: Option<NaiveDate>,
    #[serde(default = "default_harmonic_order")]
    pub harmonic_order: u32,
    /// Cycles per year of the first harmonic
    #[serde(default = "default_unit")]
    pub fundamental_frequency: f64,
    /// Multiplier applied to amplitude layers
    #[serde(default = "default_unit")]
    pub amplitude_scale: f64,
    /// Explicit regressor names; defaults to the harmonic set of `harmonic_order`
    #[serde(default)]
    pub regressor_set: Option<Vec<String>>,
    /// Raster rows per regression tile
    #[serde(default = "default_tile_rows")]
    pub tile_rows: usize,
    #[serde(default)]
    pub solver: SolverKind,
    /// Region output layers are clipped to on export
    #[serde(default)]
    pub clip_region: Option<BoundingBox>,
}

fn default_harmonic_order() -> u32 {
    1
}

fn default_unit() -> f64 {
    1.0
}

fn default_tile_rows() -> usize {
    64
}

impl HarmonicConfig {
    /// Minimal configuration: NDVI-style index over two bands, no masking, no rescaling
    pub fn new(numerator_band: impl Into<String>, denominator_band: impl Into<String>, epoch: NaiveDate) -> Self {
        Self {
            cloud_mask_bits: 0,
            saturation_band: None,
            band_rescale: BTreeMap::new(),
            index_bands: (numerator_band.into(), denominator_band.into()),
            epoch: Some(epoch),
            harmonic_order: default_harmonic_order(),
            fundamental_frequency: default_unit(),
            amplitude_scale: default_unit(),
            regressor_set: None,
            tile_rows: default_tile_rows(),
            solver: SolverKind::default(),
            clip_region: None,
        }
    }

    /// Landsat 8 Collection 2 Level 2 surface reflectance setup.
    ///
    /// QA_PIXEL bits 0-4 (fill, dilated cloud, cirrus, cloud, shadow) mask the
    /// pixel, QA_RADSAT must be zero, SR bands are scaled to reflectance and
    /// ST bands to Kelvin. NDVI = (SR_B5 - SR_B4) / (SR_B5 + SR_B4), amplitude
    /// is scaled by 5 for display contrast.
    pub fn landsat8_c2l2() -> Self {
        let mut band_rescale = BTreeMap::new();
        band_rescale.insert("SR_B.".to_string(), Rescale::new(0.0000275, -0.2));
        band_rescale.insert("ST_B.*".to_string(), Rescale::new(0.00341802, 149.0));

        Self {
            cloud_mask_bits: 0b11111,
            saturation_band: Some("QA_RADSAT".to_string()),
            band_rescale,
            index_bands: ("SR_B5".to_string(), "SR_B4".to_string()),
            epoch: NaiveDate::from_ymd_opt(1970, 1, 1),
            harmonic_order: 1,
            fundamental_frequency: 1.0,
            amplitude_scale: 5.0,
            regressor_set: None,
            tile_rows: default_tile_rows(),
            solver: SolverKind::Qr,
            clip_region: None,
        }
    }

    pub fn from_json_str(json: &str) -> HarmonicResult<Self> {
        let config: HarmonicConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> HarmonicResult<Self> {
        let path_ref = path.as_ref();
        log::info!("Reading harmonic configuration: {}", path_ref.display());
        let contents = fs::read_to_string(path_ref)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> HarmonicResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Epoch, or `InvalidConfiguration` when unset
    pub fn epoch(&self) -> HarmonicResult<NaiveDate> {
        self.epoch
            .ok_or_else(|| HarmonicError::InvalidConfiguration("epoch is not set".to_string()))
    }

    /// Regressors of the harmonic pass
    pub fn regressors(&self) -> HarmonicResult<RegressorSet> {
        match &self.regressor_set {
            Some(names) => RegressorSet::from_names(names.as_slice()),
            None => RegressorSet::harmonic(self.harmonic_order),
        }
    }

    /// Check every option; called before any pixel processing starts
    pub fn validate(&self) -> HarmonicResult<()> {
        let invalid = |msg: String| Err(HarmonicError::InvalidConfiguration(msg));

        self.epoch()?;

        if self.harmonic_order == 0 {
            return invalid("harmonicOrder must be a positive integer".to_string());
        }
        if self.harmonic_order > MAX_HARMONIC_ORDER {
            return invalid(format!(
                "harmonicOrder {} exceeds the maximum of {}",
                self.harmonic_order, MAX_HARMONIC_ORDER
            ));
        }
        if !(self.fundamental_frequency.is_finite() && self.fundamental_frequency > 0.0) {
            return invalid(format!(
                "fundamentalFrequency must be positive, got {}",
                self.fundamental_frequency
            ));
        }
        if !(self.amplitude_scale.is_finite() && self.amplitude_scale > 0.0) {
            return invalid(format!("amplitudeScale must be positive, got {}", self.amplitude_scale));
        }
        if self.tile_rows == 0 {
            return invalid("tileRows must be at least 1".to_string());
        }

        let (numerator, denominator) = &self.index_bands;
        if numerator.is_empty() || denominator.is_empty() {
            return invalid("indexBands must name two bands".to_string());
        }
        if numerator == denominator {
            return invalid(format!("indexBands must differ, got '{}' twice", numerator));
        }
        if matches!(&self.saturation_band, Some(band) if band.is_empty()) {
            return invalid("saturationBand must not be empty".to_string());
        }

        RescaleRules::compile(&self.band_rescale)?;

        if let Some(region) = &self.clip_region {
            if !region.is_valid() {
                return invalid(format!("clipRegion is inverted: {:?}", region));
            }
        }

        // Phase/amplitude need both terms of every requested order
        let regressors = self.regressors()?;
        for order in 1..=self.harmonic_order {
            for term in [Regressor::Cos(order), Regressor::Sin(order)] {
                if regressors.position(&term).is_none() {
                    return invalid(format!(
                        "regressorSet {:?} lacks '{}' required by harmonicOrder {}",
                        regressors.names(),
                        term,
                        self.harmonic_order
                    ));
                }
            }
        }

        log::debug!("Harmonic configuration validated: {:?}", self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> HarmonicConfig {
        HarmonicConfig::new("nir", "red", NaiveDate::from_ymd_opt(2000, 1, 1).unwrap())
    }

    #[test]
    fn test_landsat_preset_is_valid() {
        let config = HarmonicConfig::landsat8_c2l2();
        assert!(config.validate().is_ok());
        assert_eq!(config.regressors().unwrap().names(), vec!["constant", "t", "cos", "sin"]);
    }

    #[test]
    fn test_missing_epoch_is_fatal() {
        let mut config = base();
        config.epoch = None;
        assert!(matches!(config.validate(), Err(HarmonicError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_non_positive_frequency_rejected() {
        let mut config = base();
        config.fundamental_frequency = 0.0;
        assert!(config.validate().is_err());
        config.fundamental_frequency = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_regressor_set_rejected() {
        let mut config = base();
        config.regressor_set = Some(vec![]);
        assert!(matches!(config.validate(), Err(HarmonicError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_regressor_set_must_cover_harmonic_order() {
        let mut config = base();
        config.regressor_set = Some(vec!["constant".into(), "t".into()]);
        assert!(config.validate().is_err());

        config.regressor_set = Some(vec!["constant".into(), "cos".into(), "sin".into()]);
        assert!(config.validate().is_ok());

        config.harmonic_order = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identical_index_bands_rejected() {
        let mut config = base();
        config.index_bands = ("nir".into(), "nir".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_rescale_pattern_rejected() {
        let mut config = base();
        config.band_rescale.insert("SR_B(".into(), Rescale::new(1.0, 0.0));
        assert!(matches!(config.validate(), Err(HarmonicError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_json_defaults() {
        let json = r#"{
            "indexBands": ["B8", "B4"],
            "epoch": "2015-01-01",
            "cloudMaskBits": 3
        }"#;
        let config = HarmonicConfig::from_json_str(json).unwrap();
        assert_eq!(config.cloud_mask_bits, 3);
        assert_eq!(config.harmonic_order, 1);
        assert_eq!(config.fundamental_frequency, 1.0);
        assert_eq!(config.amplitude_scale, 1.0);
        assert_eq!(config.tile_rows, 64);
        assert_eq!(config.solver, SolverKind::Qr);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_harmonic_order_rejected() {
        let json = r#"{
            "indexBands": ["B8", "B4"],
            "epoch": "2015-01-01",
            "harmonicOrder": 3000000000
        }"#;
        let config = HarmonicConfig::from_json_str(json).unwrap();
        assert!(matches!(config.validate(), Err(HarmonicError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_json_round_trip_of_preset() {
        let json = HarmonicConfig::landsat8_c2l2().to_json_string().unwrap();
        let parsed = HarmonicConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.band_rescale.len(), 2);
        assert_eq!(parsed.saturation_band.as_deref(), Some("QA_RADSAT"));
        assert_eq!(parsed.amplitude_scale, 5.0);
    }
}
