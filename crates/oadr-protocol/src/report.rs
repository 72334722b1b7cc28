//! Report capability, request and delivery records.
//!
//! A VEN declares capabilities, the VTN answers with requests naming the
//! `r_id`s it wants, and the VEN sends deliveries until the request is
//! cancelled. All three share a `report_specifier_id`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::target::Target;
use crate::types::{DataCollectionMode, ReadingType, ReportName, ReportType};

/// One timestamped measurement.
pub type Sample = (DateTime<Utc>, f64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingRate {
    pub min_period: Duration,
    pub max_period: Duration,
    pub on_change: bool,
}

impl SamplingRate {
    pub fn new(min_period: Duration, max_period: Duration) -> Result<Self, ValidationError> {
        if min_period > max_period {
            return Err(ValidationError::InvalidSamplingRate {
                min_secs: min_period.as_secs(),
                max_secs: max_period.as_secs(),
            });
        }
        Ok(Self {
            min_period,
            max_period,
            on_change: false,
        })
    }

    /// Clamps a requested interval into `[min_period, max_period]`.
    pub fn clamp(&self, interval: Duration) -> Duration {
        interval
            .min(self.max_period)
            .max(self.min_period)
    }
}

impl Default for SamplingRate {
    fn default() -> Self {
        Self {
            min_period: Duration::from_secs(10),
            max_period: Duration::from_secs(24 * 3600),
            on_change: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub scale: String,
}

impl Measurement {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            unit: unit.into(),
            scale: "none".into(),
        }
    }

    pub fn with_scale(mut self, scale: impl Into<String>) -> Self {
        self.scale = scale.into();
        self
    }
}

/// One datapoint a VEN can report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDescription {
    pub r_id: String,
    pub resource_id: Option<String>,
    pub measurement: Option<Measurement>,
    pub reading_type: ReadingType,
    pub report_type: ReportType,
    pub sampling_rate: SamplingRate,
    pub market_context: Option<String>,
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCapability {
    pub report_specifier_id: String,
    pub report_name: ReportName,
    pub data_collection_mode: DataCollectionMode,
    pub duration: Option<Duration>,
    pub dtstart: Option<DateTime<Utc>>,
    pub created_date_time: DateTime<Utc>,
    pub report_descriptions: Vec<ReportDescription>,
}

impl ReportCapability {
    pub fn description(&self, r_id: &str) -> Option<&ReportDescription> {
        self.report_descriptions.iter().find(|d| d.r_id == r_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecifierPayload {
    pub r_id: String,
    pub reading_type: ReadingType,
    pub measurement: Option<Measurement>,
}

/// A VTN's subscription to some `r_id`s of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub report_request_id: String,
    pub report_specifier_id: String,
    /// Sampling interval shared by every requested `r_id`.
    pub granularity: Duration,
    pub report_back_duration: Option<Duration>,
    pub specifier_payloads: Vec<SpecifierPayload>,
}

impl ReportRequest {
    pub fn r_ids(&self) -> impl Iterator<Item = &str> {
        self.specifier_payloads.iter().map(|p| p.r_id.as_str())
    }

    /// Cadence at which deliveries are sent back.
    pub fn reporting_interval(&self) -> Duration {
        self.report_back_duration
            .unwrap_or(self.granularity)
            .max(self.granularity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportInterval {
    pub dtstart: DateTime<Utc>,
    pub r_id: String,
    pub value: f64,
}

/// Samples for one request, sent in a single update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDelivery {
    pub report_request_id: String,
    pub report_specifier_id: String,
    pub report_name: ReportName,
    pub created_date_time: DateTime<Utc>,
    pub intervals: Vec<ReportInterval>,
}

impl ReportDelivery {
    pub fn new(
        report_request_id: impl Into<String>,
        report_specifier_id: impl Into<String>,
        report_name: ReportName,
        created_date_time: DateTime<Utc>,
    ) -> Self {
        Self {
            report_request_id: report_request_id.into(),
            report_specifier_id: report_specifier_id.into(),
            report_name,
            created_date_time,
            intervals: Vec::new(),
        }
    }

    pub fn push_samples(&mut self, r_id: &str, samples: impl IntoIterator<Item = Sample>) {
        self.intervals
            .extend(samples.into_iter().map(|(dtstart, value)| ReportInterval {
                dtstart,
                r_id: r_id.to_string(),
                value,
            }));
    }

    /// Samples grouped by `r_id`, groups in first-seen order.
    pub fn samples_by_r_id(&self) -> Vec<(String, Vec<Sample>)> {
        let mut groups: Vec<(String, Vec<Sample>)> = Vec::new();
        for interval in &self.intervals {
            let sample = (interval.dtstart, interval.value);
            match groups.iter_mut().find(|(r_id, _)| *r_id == interval.r_id) {
                Some((_, samples)) => samples.push(sample),
                None => groups.push((interval.r_id.clone(), vec![sample])),
            }
        }
        groups
    }
}

/// Intervals an incremental delivery must hold before it is sent.
///
/// `None` means every collection run is sent on its own: full mode, or a
/// report-back duration no longer than the sampling interval.
pub fn expected_interval_count(
    r_id_count: usize,
    granularity: Duration,
    report_back_duration: Option<Duration>,
    mode: DataCollectionMode,
) -> Option<usize> {
    if mode != DataCollectionMode::Incremental || granularity.is_zero() {
        return None;
    }
    let report_back = report_back_duration?;
    if report_back <= granularity {
        return None;
    }
    let per_r_id = report_back.as_nanos() / granularity.as_nanos();
    usize::try_from(per_r_id)
        .ok()
        .map(|n| n.saturating_mul(r_id_count))
}
