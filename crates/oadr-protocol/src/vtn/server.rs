use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oadr_transport::{HttpReply, RequestHandler, Service};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::mailbox::{Delivery, EventLookup, Mailboxes};
use super::selection::{negotiate, ReportValues, VtnReportCallback};
use super::{OptCallback, VtnConfig, VtnHandlers, VtnJob, VtnStats};
use crate::codec::Codec;
use crate::envelope::{EnvelopeCodec, Opened};
use crate::error::OadrError;
use crate::event::{Event, EventSignal, SignalInterval};
use crate::message::{
    new_request_id, CancelOpt, CancelPartyRegistration, CancelReport, CanceledOpt,
    CanceledPartyRegistration, CreateOpt, CreatePartyRegistration, CreatedEvent, CreatedOpt,
    CreatedPartyRegistration, DistributeEvent, Message, OadrResponse, Poll, QueryRegistration,
    RegisterReport, RegisteredReport, RequestEvent, RequestReregistration, ResponseStatus,
    UpdateReport, UpdatedReport,
};
use crate::reply::call_guarded;
use crate::scheduler::{Schedule, Scheduler};
use crate::target::Target;
use crate::types::{now, OptType, ResponseCode};

struct VenRecord {
    ven_name: String,
    registration_id: String,
    fingerprint: Option<String>,
}

struct ReportRoute {
    ven_id: String,
    callback: VtnReportCallback,
}

/// Where answers for one event go, and the last one seen.
struct OptSlot {
    callback: Option<OptCallback>,
    last_answer: Option<(u32, OptType)>,
}

enum OptTarget {
    Function(super::OptResponseHandler),
    Promise(oneshot::Sender<OptType>),
    Fallback,
}

struct RefreshTask {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    config: VtnConfig,
    envelope: EnvelopeCodec,
    handlers: VtnHandlers,
    mailboxes: Mailboxes,
    registry: Mutex<HashMap<String, VenRecord>>,
    /// Keyed by `(ven_id, event_id)`. Dropped with the completed event.
    opt_slots: Mutex<HashMap<(String, String), OptSlot>>,
    /// Keyed by `(report_request_id, r_id)`.
    report_routes: Mutex<HashMap<(String, String), ReportRoute>>,
    /// Requests the operator cancelled that the VEN has not been told about yet.
    cancelled_reports: Mutex<HashSet<String>>,
    stats: Arc<VtnStats>,
    refresh: Mutex<Option<RefreshTask>>,
}

/// The VTN engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct VtnServer {
    inner: Arc<Inner>,
}

fn status(code: ResponseCode, request_id: Option<String>) -> ResponseStatus {
    if code.is_ok() {
        ResponseStatus::ok(request_id)
    } else {
        ResponseStatus::error(code, code.description(), request_id)
    }
}

fn error_response(code: ResponseCode, description: impl Into<String>, ven_id: Option<String>) -> Message {
    Message::Response(OadrResponse {
        response: ResponseStatus::error(code, description, None),
        ven_id,
    })
}

fn unknown_event(event_id: &str) -> OadrError {
    OadrError::protocol(ResponseCode::InvalidId, format!("unknown event {event_id}"))
}

impl VtnServer {
    pub fn new(config: VtnConfig, codec: Arc<dyn Codec>, handlers: VtnHandlers) -> Self {
        let envelope = EnvelopeCodec::new(codec)
            .with_keypair(config.keypair.clone())
            .with_replay_window(config.replay_window)
            .require_signatures(config.require_signatures);
        Self {
            inner: Arc::new(Inner {
                config,
                envelope,
                handlers,
                mailboxes: Mailboxes::new(),
                registry: Mutex::new(HashMap::new()),
                opt_slots: Mutex::new(HashMap::new()),
                report_routes: Mutex::new(HashMap::new()),
                cancelled_reports: Mutex::new(HashSet::new()),
                stats: Arc::new(VtnStats::default()),
                refresh: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &VtnConfig {
        &self.inner.config
    }

    /// Fingerprint of the signing key, if any.
    pub fn fingerprint(&self) -> Option<String> {
        self.inner.envelope.fingerprint()
    }

    pub fn stats(&self) -> Arc<VtnStats> {
        Arc::clone(&self.inner.stats)
    }

    pub fn is_registered(&self, ven_id: &str) -> bool {
        self.inner.registry.lock().contains_key(ven_id)
    }

    pub fn registered_vens(&self) -> Vec<String> {
        let mut vens: Vec<String> = self.inner.registry.lock().keys().cloned().collect();
        vens.sort();
        vens
    }

    /// Name the VEN registered with.
    pub fn ven_name(&self, ven_id: &str) -> Option<String> {
        self.inner
            .registry
            .lock()
            .get(ven_id)
            .map(|record| record.ven_name.clone())
    }

    /// Events still stored for `ven_id`.
    pub fn events_for(&self, ven_id: &str) -> Vec<Event> {
        self.inner.mailboxes.events(ven_id)
    }

    pub fn queued_messages(&self, ven_id: &str) -> usize {
        self.inner.mailboxes.queued(ven_id)
    }

    fn is_known(&self, ven_id: &str) -> bool {
        self.inner.registry.lock().contains_key(ven_id) || self.lookup(ven_id).is_some()
    }

    fn lookup(&self, ven_id: &str) -> Option<super::VenInfo> {
        self.inner
            .handlers
            .ven_lookup
            .as_ref()
            .and_then(|lookup| lookup(ven_id))
    }

    fn expected_fingerprint(&self, message: &Message) -> Option<String> {
        let ven_id = message.ven_id()?;
        if let Some(record) = self.inner.registry.lock().get(ven_id) {
            if record.fingerprint.is_some() {
                return record.fingerprint.clone();
            }
        }
        self.lookup(ven_id).and_then(|info| info.fingerprint)
    }

    fn forget_ven(&self, ven_id: &str) -> bool {
        let removed = {
            let mut registry = self.inner.registry.lock();
            let removed = registry.remove(ven_id).is_some();
            self.inner.stats.registered_vens.set(registry.len() as u64);
            removed
        };
        self.inner.mailboxes.remove(ven_id);
        self.inner
            .report_routes
            .lock()
            .retain(|_, route| route.ven_id != ven_id);
        self.inner
            .opt_slots
            .lock()
            .retain(|(ven, _), _| ven != ven_id);
        removed
    }

    // ── Operator API ────────────────────────────────

    /// Stores `event` for `ven_id`. It goes out on the VEN's next poll.
    ///
    /// `callback` receives the VEN's answers. Without one, answers go to
    /// the `on_created_event` handler.
    /// Re-adding an event id resets what was heard for it.
    pub fn add_event(
        &self,
        ven_id: &str,
        event: Event,
        callback: Option<OptCallback>,
    ) -> Result<(), OadrError> {
        if self.inner.handlers.on_poll.is_some() {
            tracing::error!(
                %ven_id,
                event_id = %event.event_id,
                "an on_poll handler replaces the mailbox, dropping the event"
            );
            return Err(OadrError::Config(
                "events cannot be queued while an on_poll handler is installed".into(),
            ));
        }

        self.inner.opt_slots.lock().insert(
            (ven_id.to_string(), event.event_id.clone()),
            OptSlot {
                callback,
                last_answer: None,
            },
        );
        tracing::debug!(%ven_id, event_id = %event.event_id, "event added");
        self.inner.mailboxes.add_event(ven_id, event);
        Ok(())
    }

    /// Builds a single-signal event targeted at `ven_id` and adds it.
    ///
    /// The active period spans the intervals. Returns the event id.
    pub fn add_simple_event(
        &self,
        ven_id: &str,
        signal_name: &str,
        signal_type: &str,
        intervals: Vec<SignalInterval>,
        callback: Option<OptCallback>,
    ) -> Result<String, OadrError> {
        let signal = EventSignal::parse(signal_name, signal_type, intervals)?;
        let event = Event::builder()
            .signal(signal)
            .target(Target::ven_id(ven_id))
            .build()?;
        let event_id = event.event_id.clone();
        self.add_event(ven_id, event, callback)?;
        Ok(event_id)
    }

    /// Changes a stored event and bumps its modification number.
    pub fn modify_event<F>(&self, ven_id: &str, event_id: &str, change: F) -> Result<(), OadrError>
    where
        F: FnOnce(&mut Event),
    {
        let updated = self.inner.mailboxes.update_event(ven_id, event_id, |event| {
            change(event);
            event.increment_modification();
        });
        if updated {
            Ok(())
        } else {
            Err(unknown_event(event_id))
        }
    }

    pub fn cancel_event(&self, ven_id: &str, event_id: &str) -> Result<(), OadrError> {
        if self.inner.mailboxes.cancel_event(ven_id, event_id) {
            tracing::info!(%ven_id, %event_id, "event cancelled");
            Ok(())
        } else {
            Err(unknown_event(event_id))
        }
    }

    pub fn request_reregistration(&self, ven_id: &str) {
        self.inner.mailboxes.enqueue(
            ven_id,
            Message::RequestReregistration(RequestReregistration {
                ven_id: ven_id.to_string(),
            }),
        );
    }

    /// Queues a registration cancellation for `ven_id`.
    pub fn cancel_party_registration(&self, ven_id: &str) -> Result<(), OadrError> {
        let registration_id = self
            .inner
            .registry
            .lock()
            .get(ven_id)
            .map(|record| record.registration_id.clone())
            .or_else(|| self.lookup(ven_id).and_then(|info| info.registration_id))
            .ok_or(OadrError::NotRegistered)?;
        self.inner.mailboxes.enqueue(
            ven_id,
            Message::CancelPartyRegistration(CancelPartyRegistration {
                request_id: new_request_id(),
                registration_id,
                ven_id: ven_id.to_string(),
            }),
        );
        Ok(())
    }

    /// Stops a report the VEN is delivering.
    ///
    /// The cancellation is queued for the VEN's next poll, or rides on the
    /// answer to its next delivery, whichever comes first.
    pub fn cancel_report(&self, ven_id: &str, report_request_id: &str) -> Result<(), OadrError> {
        let removed = {
            let mut routes = self.inner.report_routes.lock();
            let before = routes.len();
            routes.retain(|(request_id, _), route| {
                !(request_id == report_request_id && route.ven_id == ven_id)
            });
            before - routes.len()
        };
        if removed == 0 {
            return Err(OadrError::protocol(
                ResponseCode::InvalidId,
                format!("unknown report request {report_request_id}"),
            ));
        }
        self.inner
            .cancelled_reports
            .lock()
            .insert(report_request_id.to_string());
        self.inner.mailboxes.enqueue(
            ven_id,
            Message::CancelReport(CancelReport {
                request_id: new_request_id(),
                ven_id: Some(ven_id.to_string()),
                report_request_ids: vec![report_request_id.to_string()],
                report_to_follow: false,
            }),
        );
        Ok(())
    }

    /// Recomputes event statuses now and forgets events finished longer
    /// than the retention. Returns the VENs with changes pending.
    pub fn refresh_statuses(&self) -> Vec<String> {
        self.inner.sweep(now())
    }

    // ── Running ─────────────────────────────────────

    /// Starts the periodic status refresh.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut slot = self.inner.refresh.lock();
        if slot.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(refresh_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.status_refresh_interval,
            stop_rx,
        ));
        *slot = Some(RefreshTask { stop_tx, task });
        tracing::info!(vtn_id = %self.inner.config.vtn_id, "VTN started");
    }

    pub async fn stop(&self) {
        let refresh = self.inner.refresh.lock().take();
        if let Some(refresh) = refresh {
            let _ = refresh.stop_tx.send(());
            if let Err(e) = refresh.task.await {
                tracing::warn!("status refresh task ended abnormally: {e}");
            }
            tracing::info!(vtn_id = %self.inner.config.vtn_id, "VTN stopped");
        }
    }

    // ── Request handling ────────────────────────────

    async fn respond(&self, service: Service, opened: Opened) -> Message {
        let Opened {
            message,
            signer_fingerprint,
        } = opened;
        let message_type = message.message_type();
        let ven_id = message.ven_id().map(str::to_string);

        if !message_type.accepted_on(service) {
            tracing::warn!(%service, %message_type, "message sent to the wrong service");
            return error_response(
                ResponseCode::NotRecognized,
                format!("{message_type} is not accepted on {service}"),
                ven_id,
            );
        }

        let registering = matches!(
            message,
            Message::QueryRegistration(_) | Message::CreatePartyRegistration(_)
        );
        if !registering && !ven_id.as_deref().is_some_and(|id| self.is_known(id)) {
            self.inner.stats.messages_rejected.inc();
            tracing::warn!(%message_type, ven_id = ?ven_id, "message from an unregistered VEN");
            return error_response(
                ResponseCode::NotRegisteredOrAuthorized,
                ResponseCode::NotRegisteredOrAuthorized.description(),
                ven_id,
            );
        }

        match self.route(message, signer_fingerprint).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(%message_type, "request failed: {e}");
                error_response(e.response_code(), e.to_string(), ven_id)
            }
        }
    }

    async fn route(&self, message: Message, signer: Option<String>) -> Result<Message, OadrError> {
        let reply = match message {
            Message::QueryRegistration(query) => self.on_query_registration(query),
            Message::CreatePartyRegistration(request) => {
                self.on_create_party_registration(request, signer).await
            }
            Message::CancelPartyRegistration(cancel) => {
                self.on_cancel_party_registration(cancel).await
            }
            Message::CanceledPartyRegistration(canceled) => {
                self.on_canceled_party_registration(canceled)
            }
            Message::Response(response) => Message::empty_response(response.ven_id),
            Message::Poll(poll) => self.on_poll(poll).await,
            Message::RequestEvent(request) => self.on_request_event(request),
            Message::CreatedEvent(created) => self.on_created_event(created).await?,
            Message::RegisterReport(register) => self.on_register_report(register).await,
            Message::CreatedReport(created) => {
                tracing::debug!(pending = created.pending_reports.len(), "VEN created reports");
                Message::empty_response(created.ven_id)
            }
            Message::CanceledReport(canceled) => {
                tracing::debug!(pending = canceled.pending_reports.len(), "VEN canceled reports");
                Message::empty_response(canceled.ven_id)
            }
            Message::UpdateReport(update) => self.on_update_report(update).await,
            Message::CreateOpt(opt) => self.on_create_opt(opt).await,
            Message::CancelOpt(cancel) => self.on_cancel_opt(cancel).await,
            other => {
                return Err(OadrError::protocol(
                    ResponseCode::NotRecognized,
                    format!("a VTN does not accept {}", other.message_type()),
                ))
            }
        };
        Ok(reply)
    }

    // ── Registration ────────────────────────────────

    fn on_query_registration(&self, query: QueryRegistration) -> Message {
        Message::CreatedPartyRegistration(CreatedPartyRegistration {
            response: ResponseStatus::ok(Some(query.request_id)),
            vtn_id: self.inner.config.vtn_id.clone(),
            ven_id: None,
            registration_id: None,
            profiles: self.inner.config.profiles.clone(),
            requested_poll_freq: Some(self.inner.config.requested_poll_freq),
        })
    }

    async fn on_create_party_registration(
        &self,
        request: CreatePartyRegistration,
        signer: Option<String>,
    ) -> Message {
        let decision = match &self.inner.handlers.on_create_party_registration {
            Some(handler) => match call_guarded(|| handler(&request)).await {
                Ok(decision) => decision.flatten(),
                Err(panic) => {
                    tracing::error!("registration handler panicked, rejecting: {panic}");
                    None
                }
            },
            None => Some((
                request
                    .ven_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                request
                    .registration_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            )),
        };

        let mut created = CreatedPartyRegistration {
            response: ResponseStatus::ok(Some(request.request_id.clone())),
            vtn_id: self.inner.config.vtn_id.clone(),
            ven_id: None,
            registration_id: None,
            profiles: self.inner.config.profiles.clone(),
            requested_poll_freq: Some(self.inner.config.requested_poll_freq),
        };
        match decision {
            Some((ven_id, registration_id)) => {
                tracing::info!(%ven_id, ven_name = %request.ven_name, "VEN registered");
                self.inner.stats.registrations.inc();
                {
                    let mut registry = self.inner.registry.lock();
                    registry.insert(
                        ven_id.clone(),
                        VenRecord {
                            ven_name: request.ven_name.clone(),
                            registration_id: registration_id.clone(),
                            fingerprint: signer,
                        },
                    );
                    self.inner.stats.registered_vens.set(registry.len() as u64);
                }
                created.ven_id = Some(ven_id);
                created.registration_id = Some(registration_id);
            }
            None => tracing::warn!(ven_name = %request.ven_name, "registration rejected"),
        }
        Message::CreatedPartyRegistration(created)
    }

    async fn on_cancel_party_registration(&self, cancel: CancelPartyRegistration) -> Message {
        self.forget_ven(&cancel.ven_id);
        tracing::info!(ven_id = %cancel.ven_id, "VEN cancelled its registration");
        if let Some(handler) = &self.inner.handlers.on_cancel_party_registration {
            if let Err(panic) =
                call_guarded(|| handler(&cancel.ven_id, &cancel.registration_id)).await
            {
                tracing::error!("cancel registration handler panicked: {panic}");
            }
        }
        Message::CanceledPartyRegistration(CanceledPartyRegistration {
            response: ResponseStatus::ok(Some(cancel.request_id)),
            registration_id: Some(cancel.registration_id),
            ven_id: Some(cancel.ven_id),
        })
    }

    fn on_canceled_party_registration(&self, canceled: CanceledPartyRegistration) -> Message {
        if let Some(ven_id) = &canceled.ven_id {
            self.forget_ven(ven_id);
            tracing::info!(%ven_id, "registration cancelled");
        }
        Message::empty_response(canceled.ven_id)
    }

    // ── Polling and events ──────────────────────────

    async fn on_poll(&self, poll: Poll) -> Message {
        self.inner.stats.polls.inc();
        if let Some(handler) = &self.inner.handlers.on_poll {
            return match call_guarded(|| handler(&poll.ven_id)).await {
                Ok(Some(Some(message))) => message,
                Ok(_) => Message::empty_response(Some(poll.ven_id)),
                Err(panic) => {
                    tracing::error!("poll handler panicked: {panic}");
                    Message::empty_response(Some(poll.ven_id))
                }
            };
        }

        match self.inner.mailboxes.next_delivery(&poll.ven_id, now()) {
            Some(Delivery::Events(events)) => {
                self.inner.stats.events_distributed.inc_by(events.len() as u64);
                tracing::debug!(ven_id = %poll.ven_id, count = events.len(), "distributing events");
                Message::DistributeEvent(DistributeEvent::new(
                    self.inner.config.vtn_id.clone(),
                    events,
                ))
            }
            Some(Delivery::Message(message)) => {
                if let Message::CancelReport(cancel) = &message {
                    let mut cancelled = self.inner.cancelled_reports.lock();
                    for id in &cancel.report_request_ids {
                        cancelled.remove(id);
                    }
                }
                message
            }
            None => Message::empty_response(Some(poll.ven_id)),
        }
    }

    fn on_request_event(&self, request: RequestEvent) -> Message {
        let limit = request.reply_limit.map(|n| n as usize);
        let events = self
            .inner
            .mailboxes
            .pending_events(&request.ven_id, now(), limit);
        self.inner.stats.events_distributed.inc_by(events.len() as u64);
        let mut distribute = DistributeEvent::new(self.inner.config.vtn_id.clone(), events);
        distribute.response = Some(ResponseStatus::ok(Some(request.request_id)));
        Message::DistributeEvent(distribute)
    }

    async fn on_created_event(&self, created: CreatedEvent) -> Result<Message, OadrError> {
        let ven_id = created.ven_id;
        let mut unknown = Vec::new();
        for response in created.event_responses {
            self.inner.stats.opt_responses.inc();
            let lookup = self.inner.mailboxes.find_event(&ven_id, &response.event_id);
            match lookup {
                EventLookup::Unknown => {
                    unknown.push(response.event_id);
                    continue;
                }
                EventLookup::Current {
                    modification_number,
                } if modification_number != response.modification_number => {
                    tracing::warn!(
                        %ven_id,
                        event_id = %response.event_id,
                        expected = modification_number,
                        got = response.modification_number,
                        "answer for an outdated modification, ignoring"
                    );
                    continue;
                }
                _ => {}
            }
            self.resolve_opt(
                &ven_id,
                &response.event_id,
                response.modification_number,
                response.opt_type,
            )
            .await;
        }

        if !unknown.is_empty() {
            return Err(OadrError::protocol(
                ResponseCode::InvalidId,
                format!("unknown event(s) {}", unknown.join(", ")),
            ));
        }
        Ok(Message::empty_response(Some(ven_id)))
    }

    async fn resolve_opt(
        &self,
        ven_id: &str,
        event_id: &str,
        modification_number: u32,
        opt_type: OptType,
    ) {
        let answer = (modification_number, opt_type);
        let target = {
            let mut slots = self.inner.opt_slots.lock();
            let slot = slots
                .entry((ven_id.to_string(), event_id.to_string()))
                .or_insert(OptSlot {
                    callback: None,
                    last_answer: None,
                });
            if slot.last_answer == Some(answer) {
                tracing::debug!(%ven_id, %event_id, ?opt_type, "answer repeated, ignoring");
                return;
            }
            slot.last_answer = Some(answer);
            match slot.callback.take() {
                Some(OptCallback::Function(callback)) => {
                    slot.callback = Some(OptCallback::Function(Arc::clone(&callback)));
                    OptTarget::Function(callback)
                }
                Some(OptCallback::Promise(tx)) => OptTarget::Promise(tx),
                None => OptTarget::Fallback,
            }
        };

        match target {
            OptTarget::Function(callback) => {
                if let Err(panic) = call_guarded(|| callback(ven_id, event_id, opt_type)).await {
                    tracing::error!(%event_id, "opt callback panicked: {panic}");
                }
            }
            OptTarget::Promise(tx) => {
                if tx.send(opt_type).is_err() {
                    tracing::debug!(%event_id, "nobody awaits the answer anymore");
                }
            }
            OptTarget::Fallback => match &self.inner.handlers.on_created_event {
                Some(handler) => {
                    if let Err(panic) = call_guarded(|| handler(ven_id, event_id, opt_type)).await {
                        tracing::error!(%event_id, "created event handler panicked: {panic}");
                    }
                }
                None => tracing::debug!(%ven_id, %event_id, ?opt_type, "answer with no callback"),
            },
        }
    }

    // ── Reports ─────────────────────────────────────

    async fn on_register_report(&self, register: RegisterReport) -> Message {
        let ven_id = register.ven_id.clone().unwrap_or_default();
        let mut report_requests = Vec::new();
        match &self.inner.handlers.on_register_report {
            Some(selector) => {
                for capability in &register.reports {
                    let Some(negotiated) = negotiate(selector, &ven_id, capability).await else {
                        continue;
                    };
                    {
                        let mut routes = self.inner.report_routes.lock();
                        for (r_id, callback) in negotiated.callbacks {
                            routes.insert(
                                (negotiated.request.report_request_id.clone(), r_id),
                                ReportRoute {
                                    ven_id: ven_id.clone(),
                                    callback,
                                },
                            );
                        }
                    }
                    report_requests.push(negotiated.request);
                }
            }
            None => tracing::debug!(%ven_id, "no report selector, requesting nothing"),
        }

        tracing::info!(
            %ven_id,
            offered = register.reports.len(),
            requested = report_requests.len(),
            "reports registered"
        );
        Message::RegisteredReport(RegisteredReport {
            response: ResponseStatus::ok(Some(register.request_id)),
            ven_id: register.ven_id,
            report_requests,
        })
    }

    async fn on_update_report(&self, update: UpdateReport) -> Message {
        let ven_id = update.ven_id.clone().unwrap_or_default();
        let mut cancelled = Vec::new();

        for delivery in &update.reports {
            self.inner.stats.reports_received.inc();
            let request_id = &delivery.report_request_id;
            if self.inner.cancelled_reports.lock().remove(request_id) {
                cancelled.push(request_id.clone());
                continue;
            }

            for (r_id, samples) in delivery.samples_by_r_id() {
                let Some(callback) = self.report_callback(request_id, &r_id) else {
                    continue;
                };
                let values = ReportValues {
                    ven_id: ven_id.clone(),
                    report_request_id: request_id.clone(),
                    r_id,
                    samples,
                };
                if let Err(panic) = call_guarded(|| callback(values)).await {
                    tracing::error!(%request_id, "report callback panicked: {panic}");
                }
            }
        }

        let cancel_report = if cancelled.is_empty() {
            None
        } else {
            self.inner.mailboxes.withdraw(&ven_id, |message| {
                matches!(message, Message::CancelReport(cancel)
                    if cancel.report_request_ids.iter().any(|id| cancelled.contains(id)))
            });
            Some(CancelReport {
                request_id: new_request_id(),
                ven_id: update.ven_id.clone(),
                report_request_ids: cancelled,
                report_to_follow: false,
            })
        };

        Message::UpdatedReport(UpdatedReport {
            response: ResponseStatus::ok(Some(update.request_id)),
            ven_id: update.ven_id,
            cancel_report,
        })
    }

    /// The callback for one `r_id` of a request, or the fallback handler
    /// when the request has no callbacks at all.
    fn report_callback(&self, request_id: &str, r_id: &str) -> Option<VtnReportCallback> {
        let routes = self.inner.report_routes.lock();
        if let Some(route) = routes.get(&(request_id.to_string(), r_id.to_string())) {
            return Some(Arc::clone(&route.callback));
        }
        if routes.keys().any(|(id, _)| id == request_id) {
            tracing::warn!(%request_id, %r_id, "data for an r_id that was not requested");
            return None;
        }
        match &self.inner.handlers.on_update_report {
            Some(fallback) => Some(Arc::clone(fallback)),
            None => {
                tracing::warn!(%request_id, %r_id, "no handler for report data, dropping it");
                None
            }
        }
    }

    // ── Opts ────────────────────────────────────────

    async fn on_create_opt(&self, opt: CreateOpt) -> Message {
        tracing::info!(
            ven_id = %opt.ven_id,
            opt_id = %opt.opt_id,
            opt_type = ?opt.opt_type,
            event_id = ?opt.event_id,
            "opt received"
        );
        let code = match &self.inner.handlers.on_create_opt {
            Some(handler) => match call_guarded(|| handler(&opt)).await {
                Ok(code) => code.unwrap_or(ResponseCode::Ok),
                Err(panic) => {
                    tracing::error!("create opt handler panicked: {panic}");
                    ResponseCode::DeploymentError
                }
            },
            None => ResponseCode::Ok,
        };
        Message::CreatedOpt(CreatedOpt {
            response: status(code, Some(opt.request_id)),
            opt_id: opt.opt_id,
        })
    }

    async fn on_cancel_opt(&self, cancel: CancelOpt) -> Message {
        let code = match &self.inner.handlers.on_cancel_opt {
            Some(handler) => match call_guarded(|| handler(&cancel.ven_id, &cancel.opt_id)).await {
                Ok(code) => code.unwrap_or(ResponseCode::Ok),
                Err(panic) => {
                    tracing::error!("cancel opt handler panicked: {panic}");
                    ResponseCode::DeploymentError
                }
            },
            None => ResponseCode::Ok,
        };
        Message::CanceledOpt(CanceledOpt {
            response: status(code, Some(cancel.request_id)),
            opt_id: cancel.opt_id,
        })
    }

    fn seal(&self, message: &Message) -> HttpReply {
        match self.inner.envelope.seal(message) {
            Ok(body) => HttpReply::ok(body),
            Err(e) => {
                tracing::error!(message_type = %message.message_type(), "cannot seal reply: {e}");
                HttpReply::empty(500)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for VtnServer {
    async fn handle(&self, service: Service, body: Vec<u8>) -> HttpReply {
        let opened = match self
            .inner
            .envelope
            .open_with(&body, |message| self.expected_fingerprint(message))
        {
            Ok(opened) => opened,
            Err(e) if e.is_security() => {
                self.inner.stats.messages_rejected.inc();
                tracing::warn!(%service, "discarding VEN message: {e}");
                return HttpReply::empty(400);
            }
            Err(e) => {
                self.inner.stats.messages_rejected.inc();
                tracing::warn!(%service, "undecodable VEN message: {e}");
                return self.seal(&error_response(ResponseCode::InvalidData, e.to_string(), None));
            }
        };
        let reply = self.respond(service, opened).await;
        self.seal(&reply)
    }
}

impl Inner {
    fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let flagged = self.mailboxes.refresh(now);
        let pruned = self
            .mailboxes
            .prune_completed(now, self.config.completed_retention);
        if !pruned.is_empty() {
            let mut slots = self.opt_slots.lock();
            for key in &pruned {
                slots.remove(key);
            }
            tracing::debug!(count = pruned.len(), "forgot finished events");
        }
        flagged
    }
}

async fn refresh_loop(inner: Weak<Inner>, interval: Duration, mut stop_rx: oneshot::Receiver<()>) {
    let (mut scheduler, mut fired_rx) = Scheduler::new();
    scheduler.add_job(VtnJob::StatusRefresh, Schedule::every(interval));
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            Some(job) = fired_rx.recv() => match job {
                VtnJob::StatusRefresh => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    let flagged = inner.sweep(now());
                    if !flagged.is_empty() {
                        tracing::debug!(vens = ?flagged, "event statuses changed");
                    }
                }
            },
        }
    }
    scheduler.shutdown();
}
