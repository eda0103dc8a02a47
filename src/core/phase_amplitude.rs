use crate::core::design_matrix::Regressor;
use crate::core::regression::CoefficientGrid;
use crate::types::{DerivedLayer, HarmonicError, HarmonicResult};
use ndarray::Zip;
use std::f64::consts::PI;

pub const SEASONALITY_RED: &str = "seasonality_red";
pub const SEASONALITY_GREEN: &str = "seasonality_green";
pub const SEASONALITY_BLUE: &str = "seasonality_blue";

/// `phase` for the first harmonic, `phaseN` above
pub fn phase_layer_name(order: u32) -> String {
    match order {
        1 => "phase".to_string(),
        n => format!("phase{}", n),
    }
}

/// `amplitude` for the first harmonic, `amplitudeN` above
pub fn amplitude_layer_name(order: u32) -> String {
    match order {
        1 => "amplitude".to_string(),
        n => format!("amplitude{}", n),
    }
}

/// Phase and amplitude rasters of one harmonic order
#[derive(Debug, Clone)]
pub struct HarmonicLayers {
    pub order: u32,
    pub phase: DerivedLayer,
    pub amplitude: DerivedLayer,
}

/// Converts cos/sin coefficient pairs into phase and amplitude
#[derive(Debug, Clone, Copy)]
pub struct PhaseAmplitudeDeriver {
    amplitude_scale: f64,
}

impl Default for PhaseAmplitudeDeriver {
    fn default() -> Self {
        Self {
            amplitude_scale: 1.0,
        }
    }
}

impl PhaseAmplitudeDeriver {
    pub fn new(amplitude_scale: f64) -> HarmonicResult<Self> {
        if !(amplitude_scale.is_finite() && amplitude_scale > 0.0) {
            return Err(HarmonicError::InvalidConfiguration(format!(
                "Amplitude scale must be positive, got {}",
                amplitude_scale
            )));
        }
        Ok(Self { amplitude_scale })
    }

    pub fn amplitude_scale(&self) -> f64 {
        self.amplitude_scale
    }

    /// `(atan2(sin, cos) + π) / 2π`, in [0, 1]
    pub fn phase(cos: f64, sin: f64) -> f64 {
        (sin.atan2(cos) + PI) / (2.0 * PI)
    }

    /// `hypot(sin, cos) · scale`
    pub fn amplitude(&self, cos: f64, sin: f64) -> f64 {
        sin.hypot(cos) * self.amplitude_scale
    }

    /// Phase and amplitude of one harmonic order
    pub fn derive(&self, grid: &CoefficientGrid, order: u32) -> HarmonicResult<HarmonicLayers> {
        let cos = grid.coefficient_layer(&Regressor::Cos(order))?;
        let sin = grid.coefficient_layer(&Regressor::Sin(order))?;

        let phase = DerivedLayer::from_fn(phase_layer_name(order), grid.dim(), grid.geo_transform(), |r, c| {
            Some(Self::phase(cos.get(r, c)?, sin.get(r, c)?))
        });
        let amplitude =
            DerivedLayer::from_fn(amplitude_layer_name(order), grid.dim(), grid.geo_transform(), |r, c| {
                Some(self.amplitude(cos.get(r, c)?, sin.get(r, c)?))
            });

        log::debug!(
            "Harmonic order {}: phase/amplitude defined on {} pixels",
            order,
            phase.valid_count()
        );

        Ok(HarmonicLayers {
            order,
            phase,
            amplitude,
        })
    }

    /// Phase and amplitude for every complete harmonic order of the grid
    pub fn derive_all(&self, grid: &CoefficientGrid) -> HarmonicResult<Vec<HarmonicLayers>> {
        let orders = grid.regressors().complete_harmonic_orders();
        if orders.is_empty() {
            return Err(HarmonicError::InvalidConfiguration(format!(
                "No cos/sin pair in {:?}",
                grid.regressors().names()
            )));
        }
        orders.into_iter().map(|order| self.derive(grid, order)).collect()
    }
}

/// HSV to RGB with every component in [0, 1]
pub fn hsv_to_rgb(hue: f64, saturation: f64, value: f64) -> (f64, f64, f64) {
    let h = hue.clamp(0.0, 1.0) * 6.0;
    let s = saturation.clamp(0.0, 1.0);
    let v = value.clamp(0.0, 1.0);

    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);

    match sector as u32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

/// Seasonality colour composite: hue = phase, saturation = amplitude, value = mean index.
///
/// Returns the red, green and blue layers; a pixel is valid only where all
/// three inputs are.
pub fn seasonality_composite(
    phase: &DerivedLayer,
    amplitude: &DerivedLayer,
    mean_index: &DerivedLayer,
) -> HarmonicResult<[DerivedLayer; 3]> {
    let dim = phase.dim();
    if amplitude.dim() != dim || mean_index.dim() != dim {
        return Err(HarmonicError::ShapeMismatch(format!(
            "Composite inputs differ: phase {:?}, amplitude {:?}, mean {:?}",
            dim,
            amplitude.dim(),
            mean_index.dim()
        )));
    }

    let valid = Zip::from(&phase.valid)
        .and(&amplitude.valid)
        .and(&mean_index.valid)
        .map_collect(|&a, &b, &c| a && b && c);

    #[cfg(feature = "parallel")]
    let rgb = Zip::from(&phase.values)
        .and(&amplitude.values)
        .and(&mean_index.values)
        .par_map_collect(|&h, &s, &v| hsv_to_rgb(h, s, v));

    #[cfg(not(feature = "parallel"))]
    let rgb = Zip::from(&phase.values)
        .and(&amplitude.values)
        .and(&mean_index.values)
        .map_collect(|&h, &s, &v| hsv_to_rgb(h, s, v));

    let transform = phase.geo_transform;
    Ok([
        DerivedLayer::new(SEASONALITY_RED, rgb.mapv(|c| c.0), valid.clone(), transform)?,
        DerivedLayer::new(SEASONALITY_GREEN, rgb.mapv(|c| c.1), valid.clone(), transform)?,
        DerivedLayer::new(SEASONALITY_BLUE, rgb.mapv(|c| c.2), valid, transform)?,
    ])
}
