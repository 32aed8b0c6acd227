//! Parameter domains, search spaces and parameter vectors
//!
//! A `ParameterSpace` is an ordered list of bounded domains. Every vector the
//! search engine produces is sampled from, or clamped back into, that space.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{EvaluationError, OptimizerError};

// ============================================================================
// Domains
// ============================================================================

/// Largest magnitude at which every integer is exactly representable in f64
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Widest range uniform sampling can scale without overflowing
const MAX_WIDTH: f64 = f64::MAX / 2.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    #[default]
    Continuous,
    /// Rounded to the nearest whole number after every variation
    Integer,
}

/// Inclusive bounds for one strategy hyperparameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDomain {
    pub name: String,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub kind: ParamKind,
}

impl ParamDomain {
    pub fn continuous(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            kind: ParamKind::Continuous,
        }
    }

    pub fn integer(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            min: min as f64,
            max: max as f64,
            kind: ParamKind::Integer,
        }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// Lowest and highest value this domain can actually hold
    fn effective_bounds(&self) -> (f64, f64) {
        match self.kind {
            ParamKind::Continuous => (self.min, self.max),
            ParamKind::Integer => (self.min.ceil(), self.max.floor()),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        let (lo, hi) = self.effective_bounds();
        let whole = match self.kind {
            ParamKind::Continuous => true,
            ParamKind::Integer => value.fract() == 0.0,
        };
        value.is_finite() && whole && value >= lo && value <= hi
    }

    /// Bring any value (including NaN and infinities) back into the domain.
    pub fn clamp(&self, value: f64) -> f64 {
        let (lo, hi) = self.effective_bounds();
        if value.is_nan() {
            return lo;
        }
        let value = match self.kind {
            ParamKind::Continuous => value,
            ParamKind::Integer => value.round(),
        };
        value.clamp(lo, hi)
    }

    /// Uniform sample within the domain
    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        let (lo, hi) = self.effective_bounds();
        if lo >= hi {
            return lo;
        }
        match self.kind {
            ParamKind::Continuous => rng.gen_range(lo..=hi),
            ParamKind::Integer => rng.gen_range(lo as i64..=hi as i64) as f64,
        }
    }

    fn validate(&self) -> Result<(), OptimizerError> {
        if self.name.trim().is_empty() {
            return Err(OptimizerError::InvalidDomain(
                "parameter name must not be empty".to_string(),
            ));
        }
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(OptimizerError::InvalidDomain(format!(
                "'{}' bounds must be finite",
                self.name
            )));
        }
        if self.width() > MAX_WIDTH {
            return Err(OptimizerError::InvalidDomain(format!(
                "'{}' range [{}, {}] is too wide",
                self.name, self.min, self.max
            )));
        }
        if self.kind == ParamKind::Integer
            && (self.min.abs() > MAX_EXACT_INTEGER || self.max.abs() > MAX_EXACT_INTEGER)
        {
            return Err(OptimizerError::InvalidDomain(format!(
                "'{}' integer bounds must lie within ±2^53",
                self.name
            )));
        }
        let (lo, hi) = self.effective_bounds();
        if lo > hi {
            return Err(OptimizerError::InvalidDomain(format!(
                "'{}' has empty range [{}, {}]",
                self.name, self.min, self.max
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Parameter vectors
// ============================================================================

/// Strategy hyperparameters by name. Ordered so iteration and
/// serialization are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterVector(BTreeMap<String, f64>);

impl ParameterVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.set(name, value);
        self
    }

    /// Value lookup for fitness functions
    pub fn require(&self, name: &str) -> Result<f64, EvaluationError> {
        self.get(name)
            .ok_or_else(|| EvaluationError::MissingParameter(name.to_string()))
    }

    /// Integer-valued parameter (indicator periods and the like)
    pub fn require_usize(&self, name: &str) -> Result<usize, EvaluationError> {
        let value = self.require(name)?;
        if !value.is_finite() || value < 0.0 {
            return Err(EvaluationError::InvalidParameters(format!(
                "'{name}' must be a non-negative number, got {value}"
            )));
        }
        Ok(value.round() as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for ParameterVector {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for ParameterVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

// ============================================================================
// Parameter space
// ============================================================================

/// The declared search domain: one bounded range per parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ParamDomain>", into = "Vec<ParamDomain>")]
pub struct ParameterSpace {
    domains: Vec<ParamDomain>,
}

impl ParameterSpace {
    pub fn new(domains: Vec<ParamDomain>) -> Result<Self, OptimizerError> {
        if domains.is_empty() {
            return Err(OptimizerError::InvalidDomain(
                "parameter space needs at least one parameter".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for domain in &domains {
            domain.validate()?;
            if !seen.insert(domain.name.as_str()) {
                return Err(OptimizerError::InvalidDomain(format!(
                    "duplicate parameter '{}'",
                    domain.name
                )));
            }
        }
        Ok(Self { domains })
    }

    pub fn domains(&self) -> &[ParamDomain] {
        &self.domains
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Uniform random vector within every domain
    pub fn sample(&self, rng: &mut impl Rng) -> ParameterVector {
        self.domains
            .iter()
            .map(|d| (d.name.clone(), d.sample(rng)))
            .collect()
    }

    /// True when every declared parameter is present and in bounds
    pub fn contains(&self, params: &ParameterVector) -> bool {
        self.domains
            .iter()
            .all(|d| params.get(&d.name).is_some_and(|v| d.contains(v)))
    }

    /// Project a vector onto the space. Missing parameters fall back to the
    /// domain's lower bound, unknown ones are dropped.
    pub fn clamp(&self, params: &ParameterVector) -> ParameterVector {
        self.domains
            .iter()
            .map(|d| {
                let value = params.get(&d.name).unwrap_or(d.min);
                (d.name.clone(), d.clamp(value))
            })
            .collect()
    }
}

impl TryFrom<Vec<ParamDomain>> for ParameterSpace {
    type Error = OptimizerError;

    fn try_from(domains: Vec<ParamDomain>) -> Result<Self, Self::Error> {
        Self::new(domains)
    }
}

impl From<ParameterSpace> for Vec<ParamDomain> {
    fn from(space: ParameterSpace) -> Self {
        space.domains
    }
}
