use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single size-corrected instrument measurement.
///
/// Reference rows carry the name of their material in `ref_tag`, unknown samples leave it empty.
/// Missing ratios are represented by non-finite values.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MeasurementRow {
    pub run_date: NaiveDate,
    #[serde(default)]
    pub ref_tag: Option<String>,
    #[serde(default)]
    pub sample_id: Option<String>,
    pub r31: f64,
    pub r45: f64,
    pub r46: f64,
    /// Mass-independent 17O anomaly in per mille, zero when absent
    #[serde(default)]
    pub cap17o: Option<f64>,
}

impl MeasurementRow {
    pub fn new(run_date: NaiveDate, r31: f64, r45: f64, r46: f64) -> Self {
        Self {
            run_date,
            ref_tag: None,
            sample_id: None,
            r31,
            r45,
            r46,
            cap17o: None,
        }
    }

    #[must_use]
    pub fn with_ref_tag(mut self, ref_tag: impl Into<String>) -> Self {
        self.ref_tag = Some(ref_tag.into());
        self
    }

    #[must_use]
    pub fn with_sample_id(mut self, sample_id: impl Into<String>) -> Self {
        self.sample_id = Some(sample_id.into());
        self
    }

    #[must_use]
    pub fn with_cap17o(mut self, cap17o: f64) -> Self {
        self.cap17o = Some(cap17o);
        self
    }

    /// The reference material tag, if the row is a non-blank reference measurement
    pub fn reference(&self) -> Option<&str> {
        self.ref_tag
            .as_deref()
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
    }

    pub fn cap17o(&self) -> f64 {
        self.cap17o.unwrap_or(0.0)
    }

    /// Whether all three measured ratios and the 17O anomaly are finite
    pub fn is_complete(&self) -> bool {
        self.r31.is_finite()
            && self.r45.is_finite()
            && self.r46.is_finite()
            && self.cap17o().is_finite()
    }
}
