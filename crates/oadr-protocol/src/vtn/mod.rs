//! VTN engine: registration, per-VEN mailboxes, opt collection and
//! report negotiation.
//!
//! [`VtnServer`] implements [`RequestHandler`](oadr_transport::RequestHandler),
//! so it can be mounted on a [`VtnListener`](oadr_transport::VtnListener)
//! or driven in-process through a [`Loopback`](crate::transport::Loopback).
//! Operator code adds events and queues messages through the same handle
//! that answers the VENs.

mod mailbox;
mod selection;
mod server;

use std::sync::Arc;
use std::time::Duration;

use oadr_metrics::{Counter, Gauge};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::envelope::Keypair;
use crate::message::{CreateOpt, CreatePartyRegistration, Message, Profile};
use crate::replay::DEFAULT_MAX_SKEW;
use crate::reply::Reply;
use crate::types::{OptType, ResponseCode};

pub use mailbox::{Delivery, EventLookup, Mailboxes};
pub use selection::{
    negotiate, NegotiatedRequest, RawSelection, ReportOffer, ReportSelector, ReportValues,
    Selection, SelectionElement, SelectionError, VtnReportCallback,
};
pub use server::VtnServer;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for a VTN engine.
#[derive(Debug, Clone)]
pub struct VtnConfig {
    pub vtn_id: String,
    /// Signing key for outgoing messages.
    pub keypair: Option<Keypair>,
    /// Poll frequency handed to VENs at registration.
    pub requested_poll_freq: Duration,
    /// Replay protection window for incoming signatures.
    pub replay_window: Duration,
    /// How often event statuses are recomputed.
    pub status_refresh_interval: Duration,
    /// How long finished events are remembered so late answers to them
    /// are still accepted.
    pub completed_retention: Duration,
    pub profiles: Vec<Profile>,
    /// Reject unsigned messages even from VENs with no known fingerprint.
    ///
    /// Replay protection keys on the signature's timestamp and nonce, so
    /// unsigned messages accepted while this is off are not checked for
    /// replays.
    pub require_signatures: bool,
}

impl Default for VtnConfig {
    fn default() -> Self {
        Self {
            vtn_id: "vtn".to_string(),
            keypair: None,
            requested_poll_freq: Duration::from_secs(10),
            replay_window: DEFAULT_MAX_SKEW,
            status_refresh_interval: Duration::from_secs(60),
            completed_retention: Duration::from_secs(3600),
            profiles: vec![Profile::default()],
            require_signatures: false,
        }
    }
}

impl VtnConfig {
    pub fn new(vtn_id: impl Into<String>) -> Self {
        Self {
            vtn_id: vtn_id.into(),
            ..Self::default()
        }
    }
}

// ── Operator callbacks ────────────────────────────────────────────────

/// Decides a registration. `Some((ven_id, registration_id))` accepts.
pub type RegistrationHandler =
    Arc<dyn Fn(&CreatePartyRegistration) -> Reply<Option<(String, String)>> + Send + Sync>;
/// Told `(ven_id, registration_id)` when a VEN cancels its registration.
pub type CancelRegistrationHandler = Arc<dyn Fn(&str, &str) -> Reply<()> + Send + Sync>;
/// Replaces the built-in mailbox. `None` answers with an empty response.
pub type PollHandler = Arc<dyn Fn(&str) -> Reply<Option<Message>> + Send + Sync>;
/// Receives `(ven_id, event_id, opt_type)`.
pub type OptResponseHandler = Arc<dyn Fn(&str, &str, OptType) -> Reply<()> + Send + Sync>;
pub type CreateOptHandler = Arc<dyn Fn(&CreateOpt) -> Reply<ResponseCode> + Send + Sync>;
/// Receives `(ven_id, opt_id)`.
pub type CancelOptHandler = Arc<dyn Fn(&str, &str) -> Reply<ResponseCode> + Send + Sync>;
/// Resolves VENs registered outside this process.
pub type VenLookup = Arc<dyn Fn(&str) -> Option<VenInfo> + Send + Sync>;

/// What the operator knows about a VEN it provisioned itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VenInfo {
    pub registration_id: Option<String>,
    /// Fingerprint the VEN's signatures must match.
    pub fingerprint: Option<String>,
}

/// Where a VEN's answer to one event goes.
///
/// A function hears every distinct answer, including new answers after
/// the event is modified. A promise completes with the first answer;
/// later changes go to the `on_created_event` handler.
pub enum OptCallback {
    Function(OptResponseHandler),
    Promise(oneshot::Sender<OptType>),
}

impl OptCallback {
    pub fn function<F>(callback: F) -> Self
    where
        F: Fn(&str, &str, OptType) -> Reply<()> + Send + Sync + 'static,
    {
        OptCallback::Function(Arc::new(callback))
    }

    /// A callback resolved by the first answer, and the receiving end to await.
    pub fn promise() -> (Self, oneshot::Receiver<OptType>) {
        let (tx, rx) = oneshot::channel();
        (OptCallback::Promise(tx), rx)
    }
}

impl std::fmt::Debug for OptCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptCallback::Function(_) => f.write_str("OptCallback::Function"),
            OptCallback::Promise(_) => f.write_str("OptCallback::Promise"),
        }
    }
}

#[derive(Clone, Default)]
pub struct VtnHandlers {
    pub on_create_party_registration: Option<RegistrationHandler>,
    pub on_cancel_party_registration: Option<CancelRegistrationHandler>,
    pub on_register_report: Option<ReportSelector>,
    /// Fallback for report data with no per-request callback.
    pub on_update_report: Option<VtnReportCallback>,
    pub on_poll: Option<PollHandler>,
    /// Opt responses for events added without their own callback.
    pub on_created_event: Option<OptResponseHandler>,
    pub on_create_opt: Option<CreateOptHandler>,
    pub on_cancel_opt: Option<CancelOptHandler>,
    pub ven_lookup: Option<VenLookup>,
}

impl VtnHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create_party_registration<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CreatePartyRegistration) -> Reply<Option<(String, String)>> + Send + Sync + 'static,
    {
        self.on_create_party_registration = Some(Arc::new(handler));
        self
    }

    pub fn on_cancel_party_registration<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &str) -> Reply<()> + Send + Sync + 'static,
    {
        self.on_cancel_party_registration = Some(Arc::new(handler));
        self
    }

    pub fn on_register_report(mut self, selector: ReportSelector) -> Self {
        self.on_register_report = Some(selector);
        self
    }

    pub fn on_update_report<F>(mut self, handler: F) -> Self
    where
        F: Fn(ReportValues) -> Reply<()> + Send + Sync + 'static,
    {
        self.on_update_report = Some(Arc::new(handler));
        self
    }

    pub fn on_poll<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> Reply<Option<Message>> + Send + Sync + 'static,
    {
        self.on_poll = Some(Arc::new(handler));
        self
    }

    pub fn on_created_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &str, OptType) -> Reply<()> + Send + Sync + 'static,
    {
        self.on_created_event = Some(Arc::new(handler));
        self
    }

    pub fn on_create_opt<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CreateOpt) -> Reply<ResponseCode> + Send + Sync + 'static,
    {
        self.on_create_opt = Some(Arc::new(handler));
        self
    }

    pub fn on_cancel_opt<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &str) -> Reply<ResponseCode> + Send + Sync + 'static,
    {
        self.on_cancel_opt = Some(Arc::new(handler));
        self
    }

    pub fn ven_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<VenInfo> + Send + Sync + 'static,
    {
        self.ven_lookup = Some(Arc::new(lookup));
        self
    }
}

// ── Statistics ────────────────────────────────────────────────────────

/// Activity counters of a VTN engine.
#[derive(Debug, Default, Serialize)]
pub struct VtnStats {
    pub polls: Counter,
    pub registrations: Counter,
    pub events_distributed: Counter,
    pub opt_responses: Counter,
    pub reports_received: Counter,
    pub messages_rejected: Counter,
    /// VENs currently registered.
    pub registered_vens: Gauge,
}

impl VtnStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Periodic work of a running VTN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum VtnJob {
    StatusRefresh,
}
