//! Typed payloads for every OpenADR 2.0b message.
//!
//! The engines only ever see these structures. Turning them into bytes is
//! the job of a [`Codec`](crate::codec::Codec).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::report::{ReportCapability, ReportDelivery, ReportRequest};
use crate::target::Target;
use crate::types::{MessageType, OptReason, OptType, ResponseCode};

/// Status block carried by every acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: ResponseCode,
    pub description: String,
    pub request_id: Option<String>,
}

impl ResponseStatus {
    pub fn ok(request_id: Option<String>) -> Self {
        Self {
            code: ResponseCode::Ok,
            description: ResponseCode::Ok.description().to_string(),
            request_id,
        }
    }

    pub fn error(
        code: ResponseCode,
        description: impl Into<String>,
        request_id: Option<String>,
    ) -> Self {
        Self {
            code,
            description: description.into(),
            request_id,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Registration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRegistration {
    pub request_id: String,
}

impl QueryRegistration {
    pub fn new() -> Self {
        Self {
            request_id: request_id(),
        }
    }
}

impl Default for QueryRegistration {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePartyRegistration {
    pub request_id: String,
    pub ven_id: Option<String>,
    pub ven_name: String,
    pub registration_id: Option<String>,
    pub profile_name: String,
    pub transport_name: String,
    pub transport_address: Option<String>,
    pub report_only: bool,
    pub xml_signature: bool,
    pub http_pull_model: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub profile_name: String,
    pub transports: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            profile_name: "2.0b".into(),
            transports: vec!["simpleHttp".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedPartyRegistration {
    pub response: ResponseStatus,
    pub vtn_id: String,
    pub ven_id: Option<String>,
    pub registration_id: Option<String>,
    pub profiles: Vec<Profile>,
    pub requested_poll_freq: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelPartyRegistration {
    pub request_id: String,
    pub registration_id: String,
    pub ven_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanceledPartyRegistration {
    pub response: ResponseStatus,
    pub registration_id: Option<String>,
    pub ven_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestReregistration {
    pub ven_id: String,
}

// ── Polling ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub ven_id: String,
}

/// Bare acknowledgement. An empty one answers a poll when nothing is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OadrResponse {
    pub response: ResponseStatus,
    pub ven_id: Option<String>,
}

impl OadrResponse {
    pub fn ok(ven_id: Option<String>) -> Self {
        Self {
            response: ResponseStatus::ok(None),
            ven_id,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub request_id: String,
    pub ven_id: String,
    pub reply_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributeEvent {
    pub response: Option<ResponseStatus>,
    pub request_id: String,
    pub vtn_id: String,
    pub events: Vec<Event>,
}

impl DistributeEvent {
    pub fn new(vtn_id: impl Into<String>, events: Vec<Event>) -> Self {
        Self {
            response: Some(ResponseStatus::ok(None)),
            request_id: request_id(),
            vtn_id: vtn_id.into(),
            events,
        }
    }
}

/// A VEN's decision for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResponse {
    pub code: ResponseCode,
    pub description: String,
    pub request_id: String,
    pub event_id: String,
    pub modification_number: u32,
    pub opt_type: OptType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedEvent {
    pub response: ResponseStatus,
    pub ven_id: String,
    pub event_responses: Vec<EventResponse>,
}

// ── Reports ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterReport {
    pub request_id: String,
    pub ven_id: Option<String>,
    pub reports: Vec<ReportCapability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredReport {
    pub response: ResponseStatus,
    pub ven_id: Option<String>,
    pub report_requests: Vec<ReportRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateReport {
    pub request_id: String,
    pub ven_id: Option<String>,
    pub report_requests: Vec<ReportRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedReport {
    pub response: ResponseStatus,
    pub ven_id: Option<String>,
    pub pending_reports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub request_id: String,
    pub ven_id: Option<String>,
    pub reports: Vec<ReportDelivery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedReport {
    pub response: ResponseStatus,
    pub ven_id: Option<String>,
    /// Piggybacked instruction to stop one or more report requests.
    pub cancel_report: Option<CancelReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReport {
    pub request_id: String,
    pub ven_id: Option<String>,
    pub report_request_ids: Vec<String>,
    pub report_to_follow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanceledReport {
    pub response: ResponseStatus,
    pub ven_id: Option<String>,
    pub pending_reports: Vec<String>,
}

// ── Opt schedules ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub dtstart: DateTime<Utc>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOpt {
    pub request_id: String,
    pub opt_id: String,
    pub ven_id: String,
    pub opt_type: OptType,
    pub opt_reason: OptReason,
    pub market_context: Option<String>,
    pub event_id: Option<String>,
    pub modification_number: Option<u32>,
    pub targets: Vec<Target>,
    pub availability: Vec<AvailabilityWindow>,
    pub created_date_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedOpt {
    pub response: ResponseStatus,
    pub opt_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOpt {
    pub request_id: String,
    pub opt_id: String,
    pub ven_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanceledOpt {
    pub response: ResponseStatus,
    pub opt_id: String,
}

// ── Message ──────────────────────────────────────────────────────────

/// Any OpenADR payload, tagged by its message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Poll(Poll),
    Response(OadrResponse),
    QueryRegistration(QueryRegistration),
    CreatePartyRegistration(CreatePartyRegistration),
    CreatedPartyRegistration(CreatedPartyRegistration),
    CancelPartyRegistration(CancelPartyRegistration),
    CanceledPartyRegistration(CanceledPartyRegistration),
    RequestReregistration(RequestReregistration),
    RequestEvent(RequestEvent),
    DistributeEvent(DistributeEvent),
    CreatedEvent(CreatedEvent),
    RegisterReport(RegisterReport),
    RegisteredReport(RegisteredReport),
    CreateReport(CreateReport),
    CreatedReport(CreatedReport),
    UpdateReport(UpdateReport),
    UpdatedReport(UpdatedReport),
    CancelReport(CancelReport),
    CanceledReport(CanceledReport),
    CreateOpt(CreateOpt),
    CreatedOpt(CreatedOpt),
    CancelOpt(CancelOpt),
    CanceledOpt(CanceledOpt),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Poll(_) => MessageType::Poll,
            Message::Response(_) => MessageType::Response,
            Message::QueryRegistration(_) => MessageType::QueryRegistration,
            Message::CreatePartyRegistration(_) => MessageType::CreatePartyRegistration,
            Message::CreatedPartyRegistration(_) => MessageType::CreatedPartyRegistration,
            Message::CancelPartyRegistration(_) => MessageType::CancelPartyRegistration,
            Message::CanceledPartyRegistration(_) => MessageType::CanceledPartyRegistration,
            Message::RequestReregistration(_) => MessageType::RequestReregistration,
            Message::RequestEvent(_) => MessageType::RequestEvent,
            Message::DistributeEvent(_) => MessageType::DistributeEvent,
            Message::CreatedEvent(_) => MessageType::CreatedEvent,
            Message::RegisterReport(_) => MessageType::RegisterReport,
            Message::RegisteredReport(_) => MessageType::RegisteredReport,
            Message::CreateReport(_) => MessageType::CreateReport,
            Message::CreatedReport(_) => MessageType::CreatedReport,
            Message::UpdateReport(_) => MessageType::UpdateReport,
            Message::UpdatedReport(_) => MessageType::UpdatedReport,
            Message::CancelReport(_) => MessageType::CancelReport,
            Message::CanceledReport(_) => MessageType::CanceledReport,
            Message::CreateOpt(_) => MessageType::CreateOpt,
            Message::CreatedOpt(_) => MessageType::CreatedOpt,
            Message::CancelOpt(_) => MessageType::CancelOpt,
            Message::CanceledOpt(_) => MessageType::CanceledOpt,
        }
    }

    /// The VEN a message speaks for or about, when it names one.
    pub fn ven_id(&self) -> Option<&str> {
        match self {
            Message::Poll(m) => Some(&m.ven_id),
            Message::Response(m) => m.ven_id.as_deref(),
            Message::CreatePartyRegistration(m) => m.ven_id.as_deref(),
            Message::CreatedPartyRegistration(m) => m.ven_id.as_deref(),
            Message::CancelPartyRegistration(m) => Some(&m.ven_id),
            Message::CanceledPartyRegistration(m) => m.ven_id.as_deref(),
            Message::RequestReregistration(m) => Some(&m.ven_id),
            Message::RequestEvent(m) => Some(&m.ven_id),
            Message::CreatedEvent(m) => Some(&m.ven_id),
            Message::RegisterReport(m) => m.ven_id.as_deref(),
            Message::RegisteredReport(m) => m.ven_id.as_deref(),
            Message::CreateReport(m) => m.ven_id.as_deref(),
            Message::CreatedReport(m) => m.ven_id.as_deref(),
            Message::UpdateReport(m) => m.ven_id.as_deref(),
            Message::UpdatedReport(m) => m.ven_id.as_deref(),
            Message::CancelReport(m) => m.ven_id.as_deref(),
            Message::CanceledReport(m) => m.ven_id.as_deref(),
            Message::CreateOpt(m) => Some(&m.ven_id),
            Message::CancelOpt(m) => Some(&m.ven_id),
            Message::QueryRegistration(_)
            | Message::DistributeEvent(_)
            | Message::CreatedOpt(_)
            | Message::CanceledOpt(_) => None,
        }
    }

    /// The status block, for messages that carry one.
    pub fn response(&self) -> Option<&ResponseStatus> {
        match self {
            Message::Response(m) => Some(&m.response),
            Message::CreatedPartyRegistration(m) => Some(&m.response),
            Message::CanceledPartyRegistration(m) => Some(&m.response),
            Message::DistributeEvent(m) => m.response.as_ref(),
            Message::CreatedEvent(m) => Some(&m.response),
            Message::RegisteredReport(m) => Some(&m.response),
            Message::CreatedReport(m) => Some(&m.response),
            Message::UpdatedReport(m) => Some(&m.response),
            Message::CanceledReport(m) => Some(&m.response),
            Message::CreatedOpt(m) => Some(&m.response),
            Message::CanceledOpt(m) => Some(&m.response),
            _ => None,
        }
    }

    /// An empty `oadrResponse`, the answer to a poll with nothing queued.
    pub fn empty_response(ven_id: Option<String>) -> Self {
        Message::Response(OadrResponse::ok(ven_id))
    }

    pub fn is_empty_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }
}

pub(crate) fn new_request_id() -> String {
    request_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_matches_variant() {
        let poll = Message::Poll(Poll {
            ven_id: "ven1".into(),
        });
        assert_eq!(poll.message_type(), MessageType::Poll);
        assert_eq!(poll.ven_id(), Some("ven1"));
        assert!(poll.response().is_none());

        let empty = Message::empty_response(Some("ven1".into()));
        assert!(empty.is_empty_response());
        assert!(empty.response().is_some_and(ResponseStatus::is_ok));
    }

    #[test]
    fn error_status_keeps_code_and_request() {
        let status = ResponseStatus::error(ResponseCode::InvalidId, "nope", Some("r1".into()));
        assert!(!status.is_ok());
        assert_eq!(status.code.code(), 452);
        assert_eq!(status.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn distribute_event_gets_fresh_request_ids() {
        let a = DistributeEvent::new("vtn", vec![]);
        let b = DistributeEvent::new("vtn", vec![]);
        assert_ne!(a.request_id, b.request_id);
    }
}
