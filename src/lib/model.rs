//! # Simulation Data Model
//!
//! Plain data handed between the request-handling layer and the engine.
//!
//! - `YieldSample`: one `(area, temperature)` input pair.
//! - `YieldRequest`: an ordered, immutable batch of samples.
//! - `YieldResult`: one estimated yield per sample, in request order.
//!
//! The engine moves a request to the device as two separate arrays (areas and
//! temperatures), matching the kernel's parameter layout; `YieldRequest` keeps
//! the pairs together on the host and produces those arrays on demand.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// A single simulation input.
///
/// The frontend sometimes sends numbers as JSON strings (`"100"`); both
/// forms are accepted.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct YieldSample {
    /// Planted area (m²)
    #[serde(deserialize_with = "number_or_string")]
    pub area: f32,
    /// Average temperature (°C)
    #[serde(alias = "temp", deserialize_with = "number_or_string")]
    pub temperature: f32,
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text
            .trim()
            .parse::<f32>()
            .map_err(|_| D::Error::custom(format!("expected a number, got \"{}\"", text))),
    }
}

impl YieldSample {
    /// Create a new sample
    pub fn new(area: f32, temperature: f32) -> Self {
        Self { area, temperature }
    }

    /// Both values are finite numbers
    pub fn is_finite(&self) -> bool {
        self.area.is_finite() && self.temperature.is_finite()
    }
}

impl From<(f32, f32)> for YieldSample {
    fn from((area, temperature): (f32, f32)) -> Self {
        Self { area, temperature }
    }
}

/// An ordered batch of samples. Immutable once built.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct YieldRequest {
    samples: Vec<YieldSample>,
}

impl YieldRequest {
    /// Build a request from samples
    pub fn new(samples: Vec<YieldSample>) -> Self {
        Self { samples }
    }

    /// A length-1 request
    pub fn single(area: f32, temperature: f32) -> Self {
        Self::new(vec![YieldSample::new(area, temperature)])
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[YieldSample] {
        &self.samples
    }

    /// Area column, in request order
    pub fn areas(&self) -> Vec<f32> {
        self.samples.iter().map(|s| s.area).collect()
    }

    /// Temperature column, in request order
    pub fn temperatures(&self) -> Vec<f32> {
        self.samples.iter().map(|s| s.temperature).collect()
    }
}

impl FromIterator<YieldSample> for YieldRequest {
    fn from_iter<I: IntoIterator<Item = YieldSample>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl FromIterator<(f32, f32)> for YieldRequest {
    fn from_iter<I: IntoIterator<Item = (f32, f32)>>(iter: I) -> Self {
        iter.into_iter().map(YieldSample::from).collect()
    }
}

/// Estimated yields, one per request sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct YieldResult {
    values: Vec<f32>,
}

impl YieldResult {
    pub(crate) fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// The empty result
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.values
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied()
    }
}

impl std::ops::Index<usize> for YieldResult {
    type Output = f32;

    fn index(&self, index: usize) -> &f32 {
        &self.values[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_columns_keep_order() {
        let req: YieldRequest = vec![(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]
            .into_iter()
            .collect();

        assert_eq!(req.len(), 3);
        assert_eq!(req.areas(), vec![1.0, 2.0, 3.0]);
        assert_eq!(req.temperatures(), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_sample_accepts_temp_alias() {
        let s: YieldSample = serde_json::from_str(r#"{"area": 5.0, "temp": 22.5}"#).unwrap();
        assert_eq!(s, YieldSample::new(5.0, 22.5));
    }

    #[test]
    fn test_sample_accepts_numeric_strings() {
        let s: YieldSample = serde_json::from_str(r#"{"area": "100", "temp": " 25.5 "}"#).unwrap();
        assert_eq!(s, YieldSample::new(100.0, 25.5));

        let mixed: YieldSample = serde_json::from_str(r#"{"area": 7, "temperature": "21"}"#).unwrap();
        assert_eq!(mixed, YieldSample::new(7.0, 21.0));

        assert!(serde_json::from_str::<YieldSample>(r#"{"area": "lots", "temp": 25}"#).is_err());
        assert!(serde_json::from_str::<YieldSample>(r#"{"area": true, "temp": 25}"#).is_err());
    }

    #[test]
    fn test_request_serializes_as_array() {
        let req = YieldRequest::single(1.0, 2.0);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"[{"area":1.0,"temperature":2.0}]"#);
    }

    #[test]
    fn test_finite_check() {
        assert!(YieldSample::new(1.0, 25.0).is_finite());
        assert!(!YieldSample::new(f32::NAN, 25.0).is_finite());
        assert!(!YieldSample::new(1.0, f32::INFINITY).is_finite());
    }
}
