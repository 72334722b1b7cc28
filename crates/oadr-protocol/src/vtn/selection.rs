//! Report negotiation on the VTN.
//!
//! When a VEN offers its reports, the operator's [`ReportSelector`] says
//! which `r_id`s it wants, with a callback for the data, a sampling
//! interval and optionally a reporting interval. The selector answers
//! with loosely typed element lists so a bad answer can be diagnosed
//! precisely instead of crashing the handler.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::report::{ReportCapability, ReportDescription, ReportRequest, Sample, SpecifierPayload};
use crate::reply::{call_guarded, Reply};
use crate::types::ReportName;

/// Data for one `r_id` delivered by a VEN.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportValues {
    pub ven_id: String,
    pub report_request_id: String,
    pub r_id: String,
    pub samples: Vec<Sample>,
}

/// Receives delivered report data on the VTN.
pub type VtnReportCallback = Arc<dyn Fn(ReportValues) -> Reply<()> + Send + Sync>;

/// One element of a selection answer.
#[derive(Clone)]
pub enum SelectionElement {
    Callback(VtnReportCallback),
    Duration(Duration),
    Text(String),
    Number(f64),
}

impl SelectionElement {
    pub fn callback<F>(callback: F) -> Self
    where
        F: Fn(ReportValues) -> Reply<()> + Send + Sync + 'static,
    {
        SelectionElement::Callback(Arc::new(callback))
    }

    fn kind(&self) -> &'static str {
        match self {
            SelectionElement::Callback(_) => "callback",
            SelectionElement::Duration(_) => "duration",
            SelectionElement::Text(_) => "text",
            SelectionElement::Number(_) => "number",
        }
    }
}

impl fmt::Debug for SelectionElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionElement::Callback(_) => f.write_str("Callback(..)"),
            SelectionElement::Duration(d) => f.debug_tuple("Duration").field(d).finish(),
            SelectionElement::Text(t) => f.debug_tuple("Text").field(t).finish(),
            SelectionElement::Number(n) => f.debug_tuple("Number").field(n).finish(),
        }
    }
}

/// `(callback, sampling_interval[, reporting_interval])` as returned by a selector.
pub type RawSelection = Vec<SelectionElement>;

/// A validated selection for one `r_id`.
#[derive(Clone)]
pub struct Selection {
    pub callback: VtnReportCallback,
    pub sampling_interval: Duration,
    pub reporting_interval: Option<Duration>,
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("sampling_interval", &self.sampling_interval)
            .field("reporting_interval", &self.reporting_interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("selection for r_id {r_id} has {len} element(s), expected (callback, sampling_interval) or (callback, sampling_interval, reporting_interval)")]
    WrongArity { r_id: String, len: usize },

    #[error("first element of the selection for r_id {r_id} must be a callback, got a {found}")]
    NotCallable { r_id: String, found: &'static str },

    #[error("second element of the selection for r_id {r_id} must be a sampling interval duration, got a {found}")]
    SamplingIntervalNotDuration { r_id: String, found: &'static str },

    #[error("third element of the selection for r_id {r_id} must be a reporting interval duration, got a {found}")]
    ReportingIntervalNotDuration { r_id: String, found: &'static str },

    #[error("selection names r_id {r_id}, which report {report_specifier_id} does not offer")]
    UnknownRId {
        r_id: String,
        report_specifier_id: String,
    },
}

impl Selection {
    pub fn validate(r_id: &str, raw: RawSelection) -> Result<Self, SelectionError> {
        let len = raw.len();
        let mut elements = raw.into_iter();
        let (Some(first), Some(second)) = (elements.next(), elements.next()) else {
            return Err(SelectionError::WrongArity {
                r_id: r_id.to_string(),
                len,
            });
        };
        let third = elements.next();
        if elements.next().is_some() {
            return Err(SelectionError::WrongArity {
                r_id: r_id.to_string(),
                len,
            });
        }

        let callback = match first {
            SelectionElement::Callback(callback) => callback,
            other => {
                return Err(SelectionError::NotCallable {
                    r_id: r_id.to_string(),
                    found: other.kind(),
                })
            }
        };
        let sampling_interval = match second {
            SelectionElement::Duration(d) => d,
            other => {
                return Err(SelectionError::SamplingIntervalNotDuration {
                    r_id: r_id.to_string(),
                    found: other.kind(),
                })
            }
        };
        let reporting_interval = match third {
            None => None,
            Some(SelectionElement::Duration(d)) => Some(d),
            Some(other) => {
                return Err(SelectionError::ReportingIntervalNotDuration {
                    r_id: r_id.to_string(),
                    found: other.kind(),
                })
            }
        };

        Ok(Self {
            callback,
            sampling_interval,
            reporting_interval,
        })
    }
}

/// One offered `r_id`, as shown to a compact selector.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOffer {
    pub ven_id: String,
    pub report_specifier_id: String,
    pub report_name: ReportName,
    pub description: ReportDescription,
}

type CompactSelector = dyn Fn(&ReportOffer) -> Reply<Option<RawSelection>> + Send + Sync;
type FullSelector =
    dyn Fn(&str, &ReportCapability) -> Reply<Option<Vec<(String, RawSelection)>>> + Send + Sync;

/// Operator hook deciding which offered reports to request.
#[derive(Clone)]
pub enum ReportSelector {
    /// Called once per offered `r_id`. `None` skips it.
    Compact(Arc<CompactSelector>),
    /// Called once per offered report with the VEN id. Returns the wanted
    /// `r_id`s, or `None` for none.
    Full(Arc<FullSelector>),
}

impl ReportSelector {
    pub fn compact<F>(selector: F) -> Self
    where
        F: Fn(&ReportOffer) -> Reply<Option<RawSelection>> + Send + Sync + 'static,
    {
        ReportSelector::Compact(Arc::new(selector))
    }

    pub fn full<F>(selector: F) -> Self
    where
        F: Fn(&str, &ReportCapability) -> Reply<Option<Vec<(String, RawSelection)>>>
            + Send
            + Sync
            + 'static,
    {
        ReportSelector::Full(Arc::new(selector))
    }
}

/// A report request to send, with the callbacks for its `r_id`s.
#[derive(Clone)]
pub struct NegotiatedRequest {
    pub request: ReportRequest,
    pub callbacks: Vec<(String, VtnReportCallback)>,
}

/// Asks `selector` about one offered report and builds the request.
///
/// `None` when nothing is wanted or the selector answered badly.
pub async fn negotiate(
    selector: &ReportSelector,
    ven_id: &str,
    capability: &ReportCapability,
) -> Option<NegotiatedRequest> {
    let selections = match select(selector, ven_id, capability).await {
        Ok(selections) => selections,
        Err(e) => {
            tracing::error!(
                report_specifier_id = %capability.report_specifier_id,
                "invalid report selection, requesting nothing: {e}"
            );
            return None;
        }
    };
    if selections.is_empty() {
        return None;
    }

    let sampling_interval = selections
        .iter()
        .map(|(_, s)| s.sampling_interval)
        .min()?;
    if selections
        .iter()
        .any(|(_, s)| s.sampling_interval != sampling_interval)
    {
        tracing::warn!(
            report_specifier_id = %capability.report_specifier_id,
            "r_ids of one report asked for different sampling intervals, using the smallest ({:?})",
            sampling_interval
        );
    }
    let reporting_interval = selections
        .iter()
        .filter_map(|(_, s)| s.reporting_interval)
        .min()
        .unwrap_or(sampling_interval);

    let mut specifier_payloads = Vec::with_capacity(selections.len());
    let mut callbacks = Vec::with_capacity(selections.len());
    for (r_id, selection) in selections {
        let Some(description) = capability.description(&r_id) else {
            continue;
        };
        specifier_payloads.push(SpecifierPayload {
            r_id: r_id.clone(),
            reading_type: description.reading_type.clone(),
            measurement: description.measurement.clone(),
        });
        callbacks.push((r_id, selection.callback));
    }

    Some(NegotiatedRequest {
        request: ReportRequest {
            report_request_id: uuid::Uuid::new_v4().to_string(),
            report_specifier_id: capability.report_specifier_id.clone(),
            granularity: sampling_interval,
            report_back_duration: Some(reporting_interval),
            specifier_payloads,
        },
        callbacks,
    })
}

async fn select(
    selector: &ReportSelector,
    ven_id: &str,
    capability: &ReportCapability,
) -> Result<Vec<(String, Selection)>, SelectionError> {
    let mut selections = Vec::new();
    match selector {
        ReportSelector::Compact(select) => {
            for description in &capability.report_descriptions {
                let offer = ReportOffer {
                    ven_id: ven_id.to_string(),
                    report_specifier_id: capability.report_specifier_id.clone(),
                    report_name: capability.report_name.clone(),
                    description: description.clone(),
                };
                match call_guarded(|| (**select)(&offer)).await {
                    Ok(Some(Some(raw))) => {
                        selections.push((
                            description.r_id.clone(),
                            Selection::validate(&description.r_id, raw)?,
                        ));
                    }
                    Ok(_) => {}
                    Err(panic) => {
                        tracing::error!(r_id = %description.r_id, "report selector panicked: {panic}");
                    }
                }
            }
        }
        ReportSelector::Full(select) => {
            let wanted = match call_guarded(|| (**select)(ven_id, capability)).await {
                Ok(Some(Some(wanted))) => wanted,
                Ok(_) => return Ok(Vec::new()),
                Err(panic) => {
                    tracing::error!("report selector panicked: {panic}");
                    return Ok(Vec::new());
                }
            };
            for (r_id, raw) in wanted {
                if capability.description(&r_id).is_none() {
                    return Err(SelectionError::UnknownRId {
                        r_id,
                        report_specifier_id: capability.report_specifier_id.clone(),
                    });
                }
                let selection = Selection::validate(&r_id, raw)?;
                selections.push((r_id, selection));
            }
        }
    }
    Ok(selections)
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::report::{Measurement, SamplingRate};
    use crate::types::{DataCollectionMode, ReadingType, ReportType};

    fn noop() -> SelectionElement {
        SelectionElement::callback(|_| Reply::ready(()))
    }

    fn secs(n: u64) -> SelectionElement {
        SelectionElement::Duration(Duration::from_secs(n))
    }

    fn capability() -> ReportCapability {
        let description = |r_id: &str| ReportDescription {
            r_id: r_id.into(),
            resource_id: Some("meter".into()),
            measurement: Some(Measurement::new("realPower", "RealPower", "W")),
            reading_type: ReadingType::DirectRead,
            report_type: ReportType::Usage,
            sampling_rate: SamplingRate::default(),
            market_context: None,
            targets: Vec::new(),
        };
        ReportCapability {
            report_specifier_id: "spec-1".into(),
            report_name: ReportName::MetadataTelemetryUsage,
            data_collection_mode: DataCollectionMode::Incremental,
            duration: None,
            dtstart: None,
            created_date_time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            report_descriptions: vec![description("power"), description("voltage")],
        }
    }

    #[test]
    fn each_malformation_has_its_own_error() {
        assert!(matches!(
            Selection::validate("r", vec![noop()]),
            Err(SelectionError::WrongArity { len: 1, .. })
        ));
        assert!(matches!(
            Selection::validate("r", vec![noop(), secs(1), secs(2), secs(3)]),
            Err(SelectionError::WrongArity { len: 4, .. })
        ));
        assert_eq!(
            Selection::validate("r", vec![SelectionElement::Text("f".into()), secs(1)]).unwrap_err(),
            SelectionError::NotCallable {
                r_id: "r".into(),
                found: "text"
            }
        );
        assert!(matches!(
            Selection::validate("r", vec![noop(), SelectionElement::Number(10.0)]),
            Err(SelectionError::SamplingIntervalNotDuration { found: "number", .. })
        ));
        assert!(matches!(
            Selection::validate("r", vec![noop(), secs(10), SelectionElement::Text("1h".into())]),
            Err(SelectionError::ReportingIntervalNotDuration { found: "text", .. })
        ));

        let ok = Selection::validate("r", vec![noop(), secs(10), secs(60)]).unwrap();
        assert_eq!(ok.sampling_interval, Duration::from_secs(10));
        assert_eq!(ok.reporting_interval, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn compact_selection_uses_smallest_sampling_interval() {
        let selector = ReportSelector::compact(|offer| {
            let interval = if offer.description.r_id == "power" { 10 } else { 30 };
            Reply::ready(Some(vec![noop(), secs(interval), secs(60)]))
        });
        let negotiated = negotiate(&selector, "ven1", &capability()).await.unwrap();
        assert_eq!(negotiated.request.granularity, Duration::from_secs(10));
        assert_eq!(negotiated.request.report_back_duration, Some(Duration::from_secs(60)));
        assert_eq!(negotiated.request.report_specifier_id, "spec-1");
        let r_ids: Vec<_> = negotiated.request.r_ids().collect();
        assert_eq!(r_ids, ["power", "voltage"]);
        assert_eq!(negotiated.callbacks.len(), 2);
    }

    #[tokio::test]
    async fn malformed_or_empty_selection_requests_nothing() {
        let skip_all = ReportSelector::compact(|_| Reply::ready(None));
        assert!(negotiate(&skip_all, "ven1", &capability()).await.is_none());

        let malformed = ReportSelector::compact(|_| Reply::ready(Some(vec![secs(10), noop()])));
        assert!(negotiate(&malformed, "ven1", &capability()).await.is_none());

        let unknown = ReportSelector::full(|_, _| {
            Reply::ready(Some(vec![("nope".to_string(), vec![noop(), secs(10)])]))
        });
        assert!(negotiate(&unknown, "ven1", &capability()).await.is_none());
    }

    #[tokio::test]
    async fn full_selection_picks_named_r_ids() {
        let selector = ReportSelector::full(|ven_id, capability| {
            assert_eq!(ven_id, "ven1");
            assert_eq!(capability.report_descriptions.len(), 2);
            Reply::ready(Some(vec![("voltage".to_string(), vec![noop(), secs(15)])]))
        });
        let negotiated = negotiate(&selector, "ven1", &capability()).await.unwrap();
        let r_ids: Vec<_> = negotiated.request.r_ids().collect();
        assert_eq!(r_ids, ["voltage"]);
        assert_eq!(negotiated.request.report_back_duration, Some(Duration::from_secs(15)));
    }
}
