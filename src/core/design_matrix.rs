use crate::core::preprocess::Observation;
use crate::types::{HarmonicError, HarmonicResult};
use ndarray::Array2;
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Highest harmonic order a regressor set may carry
pub const MAX_HARMONIC_ORDER: u32 = 64;

/// One column of the harmonic design matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Regressor {
    /// Intercept, always 1
    Constant,
    /// Time in fractional years since the epoch
    Time,
    /// `cos(2π·t·n·f)` for harmonic order n
    Cos(u32),
    /// `sin(2π·t·n·f)` for harmonic order n
    Sin(u32),
}

impl Regressor {
    /// Value of this regressor at time `t` for fundamental frequency `frequency`
    pub fn value(&self, t: f64, frequency: f64) -> f64 {
        match *self {
            Regressor::Constant => 1.0,
            Regressor::Time => t,
            Regressor::Cos(order) => (2.0 * PI * t * order as f64 * frequency).cos(),
            Regressor::Sin(order) => (2.0 * PI * t * order as f64 * frequency).sin(),
        }
    }

    /// Harmonic order for cos/sin terms
    pub fn harmonic_order(&self) -> Option<u32> {
        match *self {
            Regressor::Cos(order) | Regressor::Sin(order) => Some(order),
            _ => None,
        }
    }
}

impl fmt::Display for Regressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Regressor::Constant => write!(f, "constant"),
            Regressor::Time => write!(f, "t"),
            Regressor::Cos(1) => write!(f, "cos"),
            Regressor::Sin(1) => write!(f, "sin"),
            Regressor::Cos(order) => write!(f, "cos{}", order),
            Regressor::Sin(order) => write!(f, "sin{}", order),
        }
    }
}

impl FromStr for Regressor {
    type Err = HarmonicError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let unknown = || HarmonicError::InvalidConfiguration(format!("Unknown regressor '{}'", name));

        let parse_order = |suffix: &str| -> Result<u32, HarmonicError> {
            if suffix.is_empty() {
                return Ok(1);
            }
            if suffix.starts_with('0') || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                return Err(unknown());
            }
            match suffix.parse::<u32>() {
                Ok(order) if order <= MAX_HARMONIC_ORDER => Ok(order),
                _ => Err(unknown()),
            }
        };

        match name {
            "constant" => Ok(Regressor::Constant),
            "t" => Ok(Regressor::Time),
            _ => {
                if let Some(suffix) = name.strip_prefix("cos") {
                    parse_order(suffix).map(Regressor::Cos)
                } else if let Some(suffix) = name.strip_prefix("sin") {
                    parse_order(suffix).map(Regressor::Sin)
                } else {
                    Err(unknown())
                }
            }
        }
    }
}

/// Ordered, duplicate-free list of regressors fixed for a whole run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegressorSet {
    regressors: Vec<Regressor>,
}

impl RegressorSet {
    pub fn new(regressors: Vec<Regressor>) -> HarmonicResult<Self> {
        if regressors.is_empty() {
            return Err(HarmonicError::InvalidConfiguration(
                "Regressor list is empty".to_string(),
            ));
        }

        for (i, r) in regressors.iter().enumerate() {
            if regressors[..i].contains(r) {
                return Err(HarmonicError::InvalidConfiguration(format!(
                    "Regressor '{}' listed more than once",
                    r
                )));
            }
        }

        Ok(Self { regressors })
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> HarmonicResult<Self> {
        let regressors = names
            .iter()
            .map(|n| n.as_ref().parse::<Regressor>())
            .collect::<HarmonicResult<Vec<_>>>()?;
        Self::new(regressors)
    }

    /// `{constant, t}`
    pub fn linear_trend() -> Self {
        Self {
            regressors: vec![Regressor::Constant, Regressor::Time],
        }
    }

    /// `{constant, t, cos, sin, cos2, sin2, ...}` up to `order`
    pub fn harmonic(order: u32) -> HarmonicResult<Self> {
        if order == 0 || order > MAX_HARMONIC_ORDER {
            return Err(HarmonicError::InvalidConfiguration(format!(
                "Harmonic order must be between 1 and {}, got {}",
                MAX_HARMONIC_ORDER, order
            )));
        }

        let mut regressors = vec![Regressor::Constant, Regressor::Time];
        for n in 1..=order {
            regressors.push(Regressor::Cos(n));
            regressors.push(Regressor::Sin(n));
        }
        Ok(Self { regressors })
    }

    pub fn len(&self) -> usize {
        self.regressors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regressors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Regressor> {
        self.regressors.iter()
    }

    pub fn as_slice(&self) -> &[Regressor] {
        &self.regressors
    }

    pub fn names(&self) -> Vec<String> {
        self.regressors.iter().map(|r| r.to_string()).collect()
    }

    pub fn position(&self, regressor: &Regressor) -> Option<usize> {
        self.regressors.iter().position(|r| r == regressor)
    }

    /// Harmonic orders that have both a cos and a sin column, ascending
    pub fn complete_harmonic_orders(&self) -> Vec<u32> {
        let mut orders: Vec<u32> = self
            .regressors
            .iter()
            .filter_map(|r| match r {
                Regressor::Cos(order) => Some(*order),
                _ => None,
            })
            .filter(|order| self.position(&Regressor::Sin(*order)).is_some())
            .collect();
        orders.sort_unstable();
        orders
    }
}

/// Regressor values for one observation time
#[derive(Debug, Clone, PartialEq)]
pub struct RegressorRow {
    pub t: f64,
    pub values: Vec<f64>,
}

impl RegressorRow {
    /// `Σ coefficient_i · value_i`
    pub fn dot(&self, coefficients: &[f64]) -> f64 {
        self.values
            .iter()
            .zip(coefficients)
            .map(|(x, c)| x * c)
            .sum()
    }
}

/// Builds regressor rows for a fixed regressor set and fundamental frequency
#[derive(Debug, Clone)]
pub struct DesignMatrixBuilder {
    regressors: RegressorSet,
    frequency: f64,
}

impl DesignMatrixBuilder {
    pub fn new(regressors: RegressorSet, frequency: f64) -> HarmonicResult<Self> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(HarmonicError::InvalidConfiguration(format!(
                "Fundamental frequency must be positive, got {}",
                frequency
            )));
        }
        Ok(Self {
            regressors,
            frequency,
        })
    }

    pub fn regressors(&self) -> &RegressorSet {
        &self.regressors
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn row(&self, t: f64) -> RegressorRow {
        RegressorRow {
            t,
            values: self
                .regressors
                .iter()
                .map(|r| r.value(t, self.frequency))
                .collect(),
        }
    }

    /// One row per observation, in the order given
    pub fn rows(&self, observations: &[Observation]) -> Vec<RegressorRow> {
        observations.iter().map(|obs| self.row(obs.t)).collect()
    }

    /// Dense `n x k` design matrix for a list of times
    pub fn design_matrix(&self, times: &[f64]) -> Array2<f64> {
        let k = self.regressors.len();
        let mut x = Array2::zeros((times.len(), k));
        for (i, &t) in times.iter().enumerate() {
            for (j, r) in self.regressors.iter().enumerate() {
                x[[i, j]] = r.value(t, self.frequency);
            }
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regressor_names_round_trip() {
        for name in ["constant", "t", "cos", "sin", "cos2", "sin3"] {
            let r: Regressor = name.parse().unwrap();
            assert_eq!(r.to_string(), name);
        }
        assert_eq!("cos1".parse::<Regressor>().unwrap(), Regressor::Cos(1));
    }

    #[test]
    fn test_unknown_regressors_rejected() {
        for name in ["", "cos0", "tan", "sinx", "T", "cos+1", "cos01", "sin 2", "cos65"] {
            assert!(name.parse::<Regressor>().is_err(), "{} should be rejected", name);
        }
        assert_eq!("cos64".parse::<Regressor>().unwrap(), Regressor::Cos(64));
    }

    #[test]
    fn test_harmonic_order_bounds() {
        assert!(RegressorSet::harmonic(0).is_err());
        assert_eq!(RegressorSet::harmonic(MAX_HARMONIC_ORDER).unwrap().len(), 2 + 2 * MAX_HARMONIC_ORDER as usize);
        assert!(matches!(
            RegressorSet::harmonic(3_000_000_000),
            Err(HarmonicError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_duplicate_regressors_rejected() {
        assert!(RegressorSet::from_names(&["constant", "t", "cos", "cos1"]).is_err());
        assert!(RegressorSet::from_names::<&str>(&[]).is_err());
    }

    #[test]
    fn test_harmonic_set_layout() {
        let set = RegressorSet::harmonic(2).unwrap();
        assert_eq!(set.names(), vec!["constant", "t", "cos", "sin", "cos2", "sin2"]);
        assert_eq!(set.complete_harmonic_orders(), vec![1, 2]);
        assert!(RegressorSet::harmonic(0).is_err());
    }

    #[test]
    fn test_row_values() {
        let builder = DesignMatrixBuilder::new(RegressorSet::harmonic(2).unwrap(), 1.0).unwrap();
        let row = builder.row(0.25);
        assert_eq!(row.values.len(), 6);
        assert_eq!(row.values[0], 1.0);
        assert_eq!(row.values[1], 0.25);
        assert!(row.values[2].abs() < 1e-12); // cos(π/2)
        assert!((row.values[3] - 1.0).abs() < 1e-12); // sin(π/2)
        assert!((row.values[4] + 1.0).abs() < 1e-12); // cos(π)
        assert!(row.values[5].abs() < 1e-12); // sin(π)
    }

    #[test]
    fn test_frequency_scales_angle() {
        let builder = DesignMatrixBuilder::new(RegressorSet::harmonic(1).unwrap(), 2.0).unwrap();
        let row = builder.row(0.25);
        assert!((row.values[2] + 1.0).abs() < 1e-12);
        assert!(DesignMatrixBuilder::new(RegressorSet::linear_trend(), 0.0).is_err());
    }

    #[test]
    fn test_design_matrix_matches_rows() {
        let builder = DesignMatrixBuilder::new(RegressorSet::harmonic(1).unwrap(), 1.0).unwrap();
        let times = [44.1, 44.6, 45.3];
        let x = builder.design_matrix(&times);
        for (i, &t) in times.iter().enumerate() {
            let row = builder.row(t);
            for j in 0..4 {
                assert_eq!(x[[i, j]], row.values[j]);
            }
        }
    }
}
