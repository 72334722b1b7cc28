//! Report capabilities, accepted requests and delivery assembly on the VEN.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::report::{
    expected_interval_count, Measurement, ReportCapability, ReportDelivery, ReportDescription,
    ReportRequest, Sample, SamplingRate,
};
use crate::reply::Reply;
use crate::types::{sub_duration, DataCollectionMode, ReadingType, ReportName, ReportType};

/// What a sample callback is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRequest {
    /// Current value(s). Used by incremental reports.
    Latest,
    /// Every sample in a window. Used by full reports.
    Window {
        date_from: DateTime<Utc>,
        date_to: DateTime<Utc>,
        sampling_interval: Duration,
    },
}

/// Produces measurements for one `r_id`.
pub type SampleCallback = Arc<dyn Fn(SampleRequest) -> Reply<Vec<Sample>> + Send + Sync>;

/// Local measurement source to be offered to the VTN.
pub struct ReportDefinition {
    callback: SampleCallback,
    report_name: ReportName,
    report_specifier_id: Option<String>,
    r_id: Option<String>,
    resource_id: Option<String>,
    measurement: Option<Measurement>,
    reading_type: ReadingType,
    report_type: ReportType,
    data_collection_mode: DataCollectionMode,
    sampling_rate: SamplingRate,
    market_context: Option<String>,
    report_duration: Option<Duration>,
}

impl ReportDefinition {
    /// Telemetry usage readings by default, collected incrementally.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(SampleRequest) -> Reply<Vec<Sample>> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            report_name: ReportName::MetadataTelemetryUsage,
            report_specifier_id: None,
            r_id: None,
            resource_id: None,
            measurement: None,
            reading_type: ReadingType::DirectRead,
            report_type: ReportType::Reading,
            data_collection_mode: DataCollectionMode::Incremental,
            sampling_rate: SamplingRate::default(),
            market_context: None,
            report_duration: None,
        }
    }

    pub fn report_name(mut self, name: ReportName) -> Self {
        self.report_name = name;
        self
    }

    pub fn report_specifier_id(mut self, id: impl Into<String>) -> Self {
        self.report_specifier_id = Some(id.into());
        self
    }

    pub fn r_id(mut self, r_id: impl Into<String>) -> Self {
        self.r_id = Some(r_id.into());
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn measurement(mut self, measurement: Measurement) -> Self {
        self.measurement = Some(measurement);
        self
    }

    pub fn reading_type(mut self, reading_type: ReadingType) -> Self {
        self.reading_type = reading_type;
        self
    }

    pub fn report_type(mut self, report_type: ReportType) -> Self {
        self.report_type = report_type;
        self
    }

    pub fn data_collection_mode(mut self, mode: DataCollectionMode) -> Self {
        self.data_collection_mode = mode;
        self
    }

    pub fn sampling_rate(mut self, rate: SamplingRate) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn market_context(mut self, context: impl Into<String>) -> Self {
        self.market_context = Some(context.into());
        self
    }

    pub fn report_duration(mut self, duration: Duration) -> Self {
        self.report_duration = Some(duration);
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.report_name.validate()?;
        self.reading_type.validate()?;
        self.report_type.validate()?;
        SamplingRate::new(self.sampling_rate.min_period, self.sampling_rate.max_period)?;
        if matches!(&self.r_id, Some(r_id) if r_id.is_empty()) {
            return Err(ValidationError::Empty { field: "r_id" });
        }
        Ok(())
    }
}

/// A report request the VEN agreed to serve.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRequest {
    pub report_request_id: String,
    pub report_specifier_id: String,
    pub report_name: ReportName,
    pub r_ids: Vec<String>,
    pub granularity: Duration,
    pub report_back_duration: Option<Duration>,
    pub mode: DataCollectionMode,
}

impl ActiveRequest {
    /// How often the collection job runs.
    pub fn job_interval(&self) -> Duration {
        match self.mode {
            DataCollectionMode::Incremental => self.granularity,
            DataCollectionMode::Full => self
                .report_back_duration
                .unwrap_or(self.granularity)
                .max(self.granularity),
        }
    }

    pub fn expected_intervals(&self) -> Option<usize> {
        expected_interval_count(
            self.r_ids.len(),
            self.granularity,
            self.report_back_duration,
            self.mode,
        )
    }
}

/// One callback invocation of a collection run.
pub struct SampleJob {
    pub r_id: String,
    pub callback: SampleCallback,
    pub request: SampleRequest,
}

#[derive(Default)]
pub struct ReportCollector {
    capabilities: Vec<ReportCapability>,
    callbacks: HashMap<(String, String), SampleCallback>,
    requests: HashMap<String, ActiveRequest>,
    pending: HashMap<String, ReportDelivery>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a measurement source. Returns `(report_specifier_id, r_id)`.
    ///
    /// Sources without an explicit specifier join the existing capability
    /// with the same name and collection mode.
    pub fn add(
        &mut self,
        definition: ReportDefinition,
        now: DateTime<Utc>,
    ) -> Result<(String, String), ValidationError> {
        definition.validate()?;

        let index = match &definition.report_specifier_id {
            Some(id) => self
                .capabilities
                .iter()
                .position(|c| &c.report_specifier_id == id),
            None => self.capabilities.iter().position(|c| {
                c.report_name == definition.report_name
                    && c.data_collection_mode == definition.data_collection_mode
            }),
        };
        let index = match index {
            Some(i) => {
                if self.capabilities[i].report_name != definition.report_name {
                    return Err(ValidationError::ReportNameConflict {
                        report_specifier_id: self.capabilities[i].report_specifier_id.clone(),
                    });
                }
                i
            }
            None => {
                self.capabilities.push(ReportCapability {
                    report_specifier_id: definition
                        .report_specifier_id
                        .clone()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    report_name: definition.report_name.clone(),
                    data_collection_mode: definition.data_collection_mode,
                    duration: definition.report_duration,
                    dtstart: None,
                    created_date_time: now,
                    report_descriptions: Vec::new(),
                });
                self.capabilities.len() - 1
            }
        };

        let capability = &mut self.capabilities[index];
        let r_id = definition
            .r_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if capability.description(&r_id).is_some() {
            return Err(ValidationError::DuplicateRId {
                report_specifier_id: capability.report_specifier_id.clone(),
                r_id,
            });
        }
        capability.report_descriptions.push(ReportDescription {
            r_id: r_id.clone(),
            resource_id: definition.resource_id,
            measurement: definition.measurement,
            reading_type: definition.reading_type,
            report_type: definition.report_type,
            sampling_rate: definition.sampling_rate,
            market_context: definition.market_context,
            targets: Vec::new(),
        });

        let specifier = capability.report_specifier_id.clone();
        self.callbacks
            .insert((specifier.clone(), r_id.clone()), definition.callback);
        Ok((specifier, r_id))
    }

    pub fn capabilities(&self) -> &[ReportCapability] {
        &self.capabilities
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Checks a VTN request against the offered capabilities.
    ///
    /// Unknown specifiers reject the whole request. Unknown `r_id`s and
    /// granularities outside an `r_id`'s sampling rate drop that `r_id`.
    pub fn accept_request(&mut self, request: &ReportRequest) -> Option<ActiveRequest> {
        let Some(capability) = self
            .capabilities
            .iter()
            .find(|c| c.report_specifier_id == request.report_specifier_id)
        else {
            tracing::error!(
                report_request_id = %request.report_request_id,
                "VTN requested unknown report specifier {}",
                request.report_specifier_id
            );
            return None;
        };

        let mut r_ids = Vec::new();
        for r_id in request.r_ids() {
            let Some(description) = capability.description(r_id) else {
                tracing::error!(
                    report_request_id = %request.report_request_id,
                    "VTN requested unknown r_id {r_id}"
                );
                continue;
            };
            let rate = description.sampling_rate;
            if request.granularity < rate.min_period || request.granularity > rate.max_period {
                tracing::error!(
                    report_request_id = %request.report_request_id,
                    "granularity {:?} for r_id {r_id} is outside its sampling rate {:?}..={:?}",
                    request.granularity,
                    rate.min_period,
                    rate.max_period
                );
                continue;
            }
            r_ids.push(r_id.to_string());
        }
        if r_ids.is_empty() {
            tracing::error!(
                report_request_id = %request.report_request_id,
                "no usable r_ids in report request, ignoring it"
            );
            return None;
        }

        let active = ActiveRequest {
            report_request_id: request.report_request_id.clone(),
            report_specifier_id: request.report_specifier_id.clone(),
            report_name: capability.report_name.data_report(),
            r_ids,
            granularity: request.granularity,
            report_back_duration: request.report_back_duration,
            mode: capability.data_collection_mode,
        };
        self.pending.remove(&active.report_request_id);
        self.requests
            .insert(active.report_request_id.clone(), active.clone());
        Some(active)
    }

    pub fn request(&self, report_request_id: &str) -> Option<&ActiveRequest> {
        self.requests.get(report_request_id)
    }

    pub fn request_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.requests.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Callback invocations for one collection run of a request.
    pub fn collection_plan(
        &self,
        report_request_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Vec<SampleJob>> {
        let request = self.requests.get(report_request_id)?;
        let sample_request = match request.mode {
            DataCollectionMode::Incremental => SampleRequest::Latest,
            DataCollectionMode::Full => SampleRequest::Window {
                date_from: sub_duration(now, request.job_interval()),
                date_to: now,
                sampling_interval: request.granularity,
            },
        };
        Some(
            request
                .r_ids
                .iter()
                .filter_map(|r_id| {
                    let key = (request.report_specifier_id.clone(), r_id.clone());
                    self.callbacks.get(&key).map(|callback| SampleJob {
                        r_id: r_id.clone(),
                        callback: Arc::clone(callback),
                        request: sample_request,
                    })
                })
                .collect(),
        )
    }

    /// Adds collected samples. Returns the delivery once it is complete.
    pub fn ingest(
        &mut self,
        report_request_id: &str,
        samples: Vec<(String, Vec<Sample>)>,
        now: DateTime<Utc>,
    ) -> Option<ReportDelivery> {
        let request = self.requests.get(report_request_id)?;
        let delivery = self
            .pending
            .entry(report_request_id.to_string())
            .or_insert_with(|| {
                ReportDelivery::new(
                    &request.report_request_id,
                    &request.report_specifier_id,
                    request.report_name.clone(),
                    now,
                )
            });
        for (r_id, values) in samples {
            delivery.push_samples(&r_id, values);
        }

        match request.expected_intervals() {
            Some(expected) if delivery.intervals.len() < expected => {
                tracing::debug!(
                    report_request_id,
                    collected = delivery.intervals.len(),
                    expected,
                    "report still accumulating"
                );
                None
            }
            _ => {
                let mut complete = self.pending.remove(report_request_id)?;
                complete.created_date_time = now;
                Some(complete)
            }
        }
    }

    pub fn pending_intervals(&self, report_request_id: &str) -> usize {
        self.pending
            .get(report_request_id)
            .map_or(0, |d| d.intervals.len())
    }

    /// Stops serving a request. Returns whether it was active.
    pub fn cancel(&mut self, report_request_id: &str) -> bool {
        self.pending.remove(report_request_id);
        self.requests.remove(report_request_id).is_some()
    }
}
