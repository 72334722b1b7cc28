use std::sync::Arc;

use oadr_transport::Service;
use tokio::sync::mpsc;

use super::events::{event_responses, EventIntake, Intake};
use super::reports::{ReportCollector, ReportDefinition, SampleJob};
use super::{
    EventHandler, HandlerError, Registration, VenCommand, VenConfig, VenHandle, VenHandlers,
    VenJob, VenSnapshot, VenState, VenStats, DEFAULT_POLL_FREQUENCY,
};
use crate::codec::Codec;
use crate::envelope::EnvelopeCodec;
use crate::error::OadrError;
use crate::event::Event;
use crate::message::{
    new_request_id, AvailabilityWindow, CancelOpt, CancelPartyRegistration, CancelReport,
    CanceledPartyRegistration, CanceledReport, CreateOpt, CreatePartyRegistration,
    CreatedEvent, CreatedPartyRegistration, CreatedReport, DistributeEvent, Message,
    OadrResponse, Poll, QueryRegistration, RegisterReport, RegisteredReport, RequestEvent,
    ResponseStatus, UpdateReport, UpdatedReport,
};
use crate::reply::{call_guarded, Reply};
use crate::report::{ReportCapability, ReportDelivery, ReportRequest, Sample};
use crate::scheduler::{Schedule, Scheduler};
use crate::target::Target;
use crate::transport::Transport;
use crate::types::{now, OptReason, OptType, ResponseCode};

// ── Link to the VTN ───────────────────────────────────────────────────

/// Everything needed to exchange one message with the VTN.
pub(super) struct Link<T> {
    transport: Arc<T>,
    envelope: Arc<EnvelopeCodec>,
    vtn_fingerprint: Option<String>,
    pub(super) stats: Arc<VenStats>,
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            envelope: Arc::clone(&self.envelope),
            vtn_fingerprint: self.vtn_fingerprint.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T: Transport> Link<T> {
    /// Sends `message` and returns the VTN's answer.
    ///
    /// Transport failures, undecodable answers and security rejections
    /// all come back as `None`.
    pub(super) async fn exchange(&self, service: Service, message: &Message) -> Option<Message> {
        let body = match self.envelope.seal(message) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(message_type = %message.message_type(), "cannot seal message: {e}");
                return None;
            }
        };

        let reply = match self.transport.post(service, body).await {
            Ok(reply) => reply,
            Err(e) => {
                self.stats.transport_failures.inc();
                tracing::warn!(%service, "request failed, treating as no message: {e}");
                return None;
            }
        };

        let opened = match self.envelope.open(&reply, self.vtn_fingerprint.as_deref()) {
            Ok(opened) => opened,
            Err(e) => {
                self.stats.messages_rejected.inc();
                if e.is_security() {
                    tracing::warn!(%service, "discarding VTN message: {e}");
                } else {
                    tracing::warn!(%service, "undecodable VTN message: {e}");
                }
                return None;
            }
        };

        self.stats.messages_received.inc();
        if let Some(status) = opened.message.response() {
            if !status.is_ok() {
                tracing::warn!(
                    message_type = %opened.message.message_type(),
                    "VTN answered {}: {}",
                    status.code,
                    status.description
                );
            }
        }
        Some(opened.message)
    }
}

/// A completed report waiting for the delivery worker.
pub(super) struct Outgoing {
    pub(super) ven_id: String,
    pub(super) delivery: ReportDelivery,
}

/// Sends one report. Returns a cancellation the VTN piggybacked on its answer.
pub(super) async fn deliver_report<T: Transport>(
    link: &Link<T>,
    outgoing: Outgoing,
) -> Option<CancelReport> {
    let report_request_id = outgoing.delivery.report_request_id.clone();
    let message = Message::UpdateReport(UpdateReport {
        request_id: new_request_id(),
        ven_id: Some(outgoing.ven_id),
        reports: vec![outgoing.delivery],
    });
    match link.exchange(Service::EiReport, &message).await {
        Some(Message::UpdatedReport(updated)) => {
            link.stats.reports_sent.inc();
            tracing::debug!(%report_request_id, "report delivered");
            updated.cancel_report
        }
        Some(other) => {
            tracing::warn!(
                %report_request_id,
                "unexpected {} in answer to a report",
                other.message_type()
            );
            None
        }
        None => {
            tracing::warn!(%report_request_id, "report delivery failed");
            None
        }
    }
}

// ── Callback guards ───────────────────────────────────────────────────

/// Runs an event callback. Anything but a clean decision is an opt-out.
async fn decide(handler: &EventHandler, event: &Event, name: &'static str) -> OptType {
    match call_guarded(|| (**handler)(event)).await {
        Ok(Some(Ok(opt))) => opt,
        Ok(Some(Err(HandlerError(reason)))) => {
            tracing::error!(event_id = %event.event_id, "{name} failed ({reason}), opting out");
            OptType::OptOut
        }
        Ok(None) => {
            tracing::error!(event_id = %event.event_id, "{name} never answered, opting out");
            OptType::OptOut
        }
        Err(panic) => {
            tracing::error!(event_id = %event.event_id, "{name} panicked ({panic}), opting out");
            OptType::OptOut
        }
    }
}

/// Runs a sample callback. Failures yield no samples.
async fn sample(job: &SampleJob) -> Vec<Sample> {
    match call_guarded(|| (*job.callback)(job.request)).await {
        Ok(Some(samples)) => samples,
        Ok(None) => {
            tracing::error!(r_id = %job.r_id, "sample callback never answered");
            Vec::new()
        }
        Err(panic) => {
            tracing::error!(r_id = %job.r_id, "sample callback panicked: {panic}");
            Vec::new()
        }
    }
}

fn ensure_ok(status: &ResponseStatus) -> Result<(), OadrError> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(OadrError::protocol(status.code, status.description.clone()))
    }
}

/// Error for an answer of the wrong type, keeping the VTN's code if it sent one.
fn unexpected(message: &Message) -> OadrError {
    if let Some(status) = message.response().filter(|status| !status.is_ok()) {
        return OadrError::protocol(status.code, status.description.clone());
    }
    OadrError::protocol(
        ResponseCode::NotRecognized,
        format!("unexpected {}", message.message_type()),
    )
}

// ── VenClient ─────────────────────────────────────────────────────────

/// The VEN side of the protocol.
pub struct VenClient<T: Transport> {
    config: VenConfig,
    link: Link<T>,
    handlers: VenHandlers,
    state: VenState,
    registration: Option<Registration>,
    intake: EventIntake,
    reports: ReportCollector,
    outbox_tx: mpsc::UnboundedSender<Outgoing>,
    outbox_rx: Option<mpsc::UnboundedReceiver<Outgoing>>,
    scheduler: Scheduler<VenJob>,
    fired_rx: Option<mpsc::UnboundedReceiver<VenJob>>,
    running: bool,
}

impl<T: Transport> VenClient<T> {
    pub fn new(config: VenConfig, transport: T, codec: Arc<dyn Codec>) -> Self {
        let envelope = EnvelopeCodec::new(codec)
            .with_keypair(config.keypair.clone())
            .with_replay_window(config.replay_window);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (scheduler, fired_rx) = Scheduler::new();
        Self {
            link: Link {
                transport: Arc::new(transport),
                envelope: Arc::new(envelope),
                vtn_fingerprint: config.vtn_fingerprint.clone(),
                stats: Arc::new(VenStats::default()),
            },
            config,
            handlers: VenHandlers::default(),
            state: VenState::Unregistered,
            registration: None,
            intake: EventIntake::new(),
            reports: ReportCollector::new(),
            outbox_tx,
            outbox_rx: Some(outbox_rx),
            scheduler,
            fired_rx: Some(fired_rx),
            running: false,
        }
    }

    /// Installs the callback deciding on new events.
    pub fn on_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Event) -> Reply<Result<OptType, HandlerError>> + Send + Sync + 'static,
    {
        self.handlers.on_event = Some(Arc::new(handler));
        self
    }

    /// Installs the callback deciding on modified events.
    pub fn on_update_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Event) -> Reply<Result<OptType, HandlerError>> + Send + Sync + 'static,
    {
        self.handlers.on_update_event = Some(Arc::new(handler));
        self
    }

    /// Offers a measurement source. Returns `(report_specifier_id, r_id)`.
    pub fn add_report(&mut self, definition: ReportDefinition) -> Result<(String, String), OadrError> {
        let ids = self.reports.add(definition, now())?;
        tracing::info!(report_specifier_id = %ids.0, r_id = %ids.1, "report capability added");
        Ok(ids)
    }

    // ── Accessors ───────────────────────────────────

    pub fn config(&self) -> &VenConfig {
        &self.config
    }

    pub fn state(&self) -> VenState {
        self.state
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    pub fn ven_id(&self) -> Option<&str> {
        self.registration.as_ref().map(|r| r.ven_id.as_str())
    }

    pub fn events(&self) -> &[Event] {
        self.intake.events()
    }

    pub fn decision(&self, event_id: &str) -> Option<OptType> {
        self.intake.decision(event_id)
    }

    pub fn stats(&self) -> Arc<VenStats> {
        Arc::clone(&self.link.stats)
    }

    pub fn report_capabilities(&self) -> &[ReportCapability] {
        self.reports.capabilities()
    }

    pub fn active_report_ids(&self) -> Vec<String> {
        self.reports.request_ids()
    }

    pub fn pending_report_intervals(&self, report_request_id: &str) -> usize {
        self.reports.pending_intervals(report_request_id)
    }

    fn require_ven_id(&self) -> Result<String, OadrError> {
        self.ven_id()
            .map(str::to_string)
            .ok_or(OadrError::NotRegistered)
    }

    // ── Registration ────────────────────────────────

    pub async fn query_registration(&self) -> Result<CreatedPartyRegistration, OadrError> {
        let message = Message::QueryRegistration(QueryRegistration::new());
        match self.link.exchange(Service::EiRegisterParty, &message).await {
            Some(Message::CreatedPartyRegistration(created)) => {
                ensure_ok(&created.response)?;
                Ok(created)
            }
            Some(other) => Err(unexpected(&other)),
            None => Err(OadrError::NoReply(Service::EiRegisterParty)),
        }
    }

    /// Registers with the VTN and, when running, schedules polling.
    pub async fn register_party(&mut self) -> Result<Registration, OadrError> {
        self.state = VenState::Registering;
        let result = self.try_register().await;
        if let Err(e) = &result {
            tracing::error!("registration failed: {e}");
            self.state = VenState::Unregistered;
        }
        result
    }

    async fn try_register(&mut self) -> Result<Registration, OadrError> {
        let requested_ven_id = self
            .registration
            .as_ref()
            .map(|r| r.ven_id.clone())
            .or_else(|| self.config.ven_id.clone());
        let message = Message::CreatePartyRegistration(CreatePartyRegistration {
            request_id: new_request_id(),
            ven_id: requested_ven_id.clone(),
            ven_name: self.config.ven_name.clone(),
            registration_id: self.registration.as_ref().map(|r| r.registration_id.clone()),
            profile_name: self.config.profile_name.clone(),
            transport_name: self.config.transport_name.clone(),
            transport_address: self.config.transport_address.clone(),
            report_only: self.config.report_only,
            xml_signature: self.config.keypair.is_some(),
            http_pull_model: self.config.http_pull_model,
        });

        let created = match self.link.exchange(Service::EiRegisterParty, &message).await {
            Some(Message::CreatedPartyRegistration(created)) => created,
            Some(other) => return Err(unexpected(&other)),
            None => return Err(OadrError::NoReply(Service::EiRegisterParty)),
        };
        ensure_ok(&created.response)?;

        let (Some(ven_id), Some(registration_id)) = (created.ven_id, created.registration_id)
        else {
            tracing::error!("VTN accepted the registration without a ven_id and registration_id");
            return Err(OadrError::NotRegistered);
        };
        if let Some(requested) = requested_ven_id.filter(|requested| *requested != ven_id) {
            tracing::warn!("VTN assigned ven_id {ven_id} instead of {requested}, using the VTN's value");
        }

        let mut poll_frequency = created.requested_poll_freq.unwrap_or(DEFAULT_POLL_FREQUENCY);
        if poll_frequency > self.config.max_poll_interval {
            tracing::warn!(
                "VTN asked for a poll every {:?}, capping at {:?}",
                poll_frequency,
                self.config.max_poll_interval
            );
            poll_frequency = self.config.max_poll_interval;
        }

        let registration = Registration {
            ven_id,
            registration_id,
            poll_frequency,
            vtn_id: created.vtn_id,
        };
        tracing::info!(
            ven_id = %registration.ven_id,
            registration_id = %registration.registration_id,
            "registered with VTN {}",
            registration.vtn_id
        );
        self.registration = Some(registration.clone());
        self.state = VenState::Registered;
        if self.running {
            self.schedule_poll();
        }
        Ok(registration)
    }

    pub async fn cancel_party_registration(&mut self) -> Result<(), OadrError> {
        let registration = self.registration.clone().ok_or(OadrError::NotRegistered)?;
        let message = Message::CancelPartyRegistration(CancelPartyRegistration {
            request_id: new_request_id(),
            registration_id: registration.registration_id,
            ven_id: registration.ven_id,
        });
        match self.link.exchange(Service::EiRegisterParty, &message).await {
            Some(Message::CanceledPartyRegistration(canceled)) => {
                ensure_ok(&canceled.response)?;
                self.forget_registration();
                Ok(())
            }
            Some(other) => Err(unexpected(&other)),
            None => Err(OadrError::NoReply(Service::EiRegisterParty)),
        }
    }

    fn forget_registration(&mut self) {
        tracing::info!("registration cancelled");
        self.registration = None;
        self.state = VenState::Unregistered;
        self.scheduler.remove_job(&VenJob::Poll);
    }

    fn schedule_poll(&mut self) {
        let Some(registration) = &self.registration else {
            return;
        };
        let mut schedule = Schedule::every(registration.poll_frequency);
        if self.config.allow_jitter {
            schedule = schedule.with_jitter();
        }
        self.scheduler.add_job(VenJob::Poll, schedule);
        self.state = VenState::Polling;
    }

    // ── Polling ─────────────────────────────────────

    /// Polls until the VTN's queue for this VEN is empty.
    ///
    /// Returns how many messages were handled.
    pub async fn poll(&mut self) -> Result<usize, OadrError> {
        self.require_ven_id()?;
        let mut handled = 0;
        while handled < self.config.max_messages_per_poll {
            let Some(ven_id) = self.ven_id().map(str::to_string) else {
                break;
            };
            self.link.stats.polls.inc();
            let poll = Message::Poll(Poll { ven_id });
            let Some(message) = self.link.exchange(Service::OadrPoll, &poll).await else {
                break;
            };
            if message.is_empty_response() {
                break;
            }
            handled += 1;
            if !self.dispatch(message).await {
                break;
            }
        }
        if handled >= self.config.max_messages_per_poll {
            tracing::warn!("stopped draining the VTN queue after {handled} messages");
        }
        Ok(handled)
    }

    /// Handles one polled message. Returns whether to keep draining.
    async fn dispatch(&mut self, message: Message) -> bool {
        let ven_id = self.ven_id().map(str::to_string);
        match message {
            Message::Response(_) => true,
            Message::RequestReregistration(_) => {
                tracing::info!("VTN requested re-registration");
                self.acknowledge(Service::EiRegisterParty).await;
                self.state = VenState::Unregistered;
                self.register_party().await.is_ok()
            }
            Message::DistributeEvent(distribute) => {
                self.handle_distribute(distribute).await;
                true
            }
            Message::CreateReport(create) => {
                let pending_reports = self.install_requests(&create.report_requests);
                let reply = Message::CreatedReport(CreatedReport {
                    response: ResponseStatus::ok(Some(create.request_id)),
                    ven_id,
                    pending_reports,
                });
                self.link.exchange(Service::EiReport, &reply).await;
                true
            }
            Message::RegisterReport(register) => {
                tracing::info!(
                    "VTN offered {} report(s), requesting none",
                    register.reports.len()
                );
                let reply = Message::RegisteredReport(RegisteredReport {
                    response: ResponseStatus::ok(Some(register.request_id)),
                    ven_id,
                    report_requests: Vec::new(),
                });
                self.link.exchange(Service::EiReport, &reply).await;
                true
            }
            Message::UpdateReport(update) => {
                tracing::debug!("VTN sent {} report(s)", update.reports.len());
                let reply = Message::UpdatedReport(UpdatedReport {
                    response: ResponseStatus::ok(Some(update.request_id)),
                    ven_id,
                    cancel_report: None,
                });
                self.link.exchange(Service::EiReport, &reply).await;
                true
            }
            Message::CancelReport(cancel) => {
                let reply = Message::CanceledReport(self.cancel_reports(&cancel));
                self.link.exchange(Service::EiReport, &reply).await;
                true
            }
            Message::CancelPartyRegistration(cancel) => {
                let reply = Message::CanceledPartyRegistration(CanceledPartyRegistration {
                    response: ResponseStatus::ok(Some(cancel.request_id)),
                    registration_id: Some(cancel.registration_id),
                    ven_id: Some(cancel.ven_id),
                });
                self.link.exchange(Service::EiRegisterParty, &reply).await;
                self.forget_registration();
                false
            }
            other => {
                tracing::warn!(
                    message_type = %other.message_type(),
                    "ignoring unexpected message from poll"
                );
                true
            }
        }
    }

    async fn acknowledge(&self, service: Service) {
        let ack = Message::Response(OadrResponse::ok(self.ven_id().map(str::to_string)));
        self.link.exchange(service, &ack).await;
    }

    // ── Events ──────────────────────────────────────

    /// Asks the VTN for all pending events and answers them.
    ///
    /// Returns the decision taken for each event received.
    pub async fn request_event(
        &mut self,
        reply_limit: Option<u32>,
    ) -> Result<Vec<(String, OptType)>, OadrError> {
        let message = Message::RequestEvent(RequestEvent {
            request_id: new_request_id(),
            ven_id: self.require_ven_id()?,
            reply_limit,
        });
        match self.link.exchange(Service::EiEvent, &message).await {
            Some(Message::DistributeEvent(distribute)) => Ok(self.handle_distribute(distribute).await),
            Some(Message::Response(_)) => Ok(Vec::new()),
            Some(other) => Err(unexpected(&other)),
            None => Err(OadrError::NoReply(Service::EiEvent)),
        }
    }

    async fn handle_distribute(&mut self, distribute: DistributeEvent) -> Vec<(String, OptType)> {
        let now = now();
        let mut decided = Vec::with_capacity(distribute.events.len());
        for event in distribute.events {
            self.link.stats.events_received.inc();
            let opt = match self.intake.receive(&event) {
                Intake::New => self.decide_new(&event).await,
                Intake::Resend {
                    previous: Some(opt),
                } => {
                    tracing::debug!(event_id = %event.event_id, "event resent, repeating {opt}");
                    opt
                }
                Intake::Resend { previous: None } if event.is_terminal_at(now) => OptType::OptOut,
                Intake::Resend { previous: None } => self.decide_new(&event).await,
                Intake::Updated { previous } => self.decide_update(&event, previous).await,
                Intake::Stale => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        modification_number = event.modification_number,
                        "older modification of a known event, dropping it"
                    );
                    continue;
                }
            };
            self.intake.record_decision(&event, opt, now);
            decided.push((event, opt));
        }

        let responses = event_responses(&decided, &distribute.request_id, now);
        if !responses.is_empty() {
            if let Some(ven_id) = self.ven_id().map(str::to_string) {
                let count = responses.len() as u64;
                let reply = Message::CreatedEvent(CreatedEvent {
                    response: ResponseStatus::ok(Some(distribute.request_id.clone())),
                    ven_id,
                    event_responses: responses,
                });
                if self.link.exchange(Service::EiEvent, &reply).await.is_some() {
                    self.link.stats.event_responses_sent.inc_by(count);
                }
            }
        }

        decided
            .into_iter()
            .map(|(event, opt)| (event.event_id, opt))
            .collect()
    }

    async fn decide_new(&self, event: &Event) -> OptType {
        match &self.handlers.on_event {
            Some(handler) => decide(handler, event, "on_event").await,
            None => {
                tracing::warn!(event_id = %event.event_id, "no on_event handler installed, opting out");
                OptType::OptOut
            }
        }
    }

    async fn decide_update(&self, event: &Event, previous: Option<OptType>) -> OptType {
        match (&self.handlers.on_update_event, previous) {
            (Some(handler), _) => decide(handler, event, "on_update_event").await,
            (None, Some(opt)) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    "event modified but no on_update_event handler installed, keeping {opt}"
                );
                opt
            }
            (None, None) => self.decide_new(event).await,
        }
    }

    /// Drops finished events. Returns their ids.
    pub fn cleanup_events(&mut self) -> Vec<String> {
        let removed = self.intake.cleanup(now());
        if !removed.is_empty() {
            tracing::debug!("dropped {} finished event(s)", removed.len());
        }
        removed
    }

    // ── Opt schedules ───────────────────────────────

    /// Sends an opt schedule, for an event or standalone. Returns the opt id.
    pub async fn create_opt(
        &self,
        opt_type: OptType,
        opt_reason: OptReason,
        event: Option<&Event>,
        availability: Vec<AvailabilityWindow>,
    ) -> Result<String, OadrError> {
        let ven_id = self.require_ven_id()?;
        let opt_id = uuid::Uuid::new_v4().to_string();
        let targets = match event {
            Some(event) if !event.targets.is_empty() => event.targets.clone(),
            _ => vec![Target::ven_id(ven_id.clone())],
        };
        let message = Message::CreateOpt(CreateOpt {
            request_id: new_request_id(),
            opt_id: opt_id.clone(),
            ven_id,
            opt_type,
            opt_reason,
            market_context: event.map(|e| e.market_context.clone()),
            event_id: event.map(|e| e.event_id.clone()),
            modification_number: event.map(|e| e.modification_number),
            targets,
            availability,
            created_date_time: now(),
        });
        match self.link.exchange(Service::EiOpt, &message).await {
            Some(Message::CreatedOpt(created)) => {
                ensure_ok(&created.response)?;
                Ok(opt_id)
            }
            Some(other) => Err(unexpected(&other)),
            None => Err(OadrError::NoReply(Service::EiOpt)),
        }
    }

    pub async fn cancel_opt(&self, opt_id: &str) -> Result<(), OadrError> {
        let message = Message::CancelOpt(CancelOpt {
            request_id: new_request_id(),
            opt_id: opt_id.to_string(),
            ven_id: self.require_ven_id()?,
        });
        match self.link.exchange(Service::EiOpt, &message).await {
            Some(Message::CanceledOpt(canceled)) => ensure_ok(&canceled.response),
            Some(other) => Err(unexpected(&other)),
            None => Err(OadrError::NoReply(Service::EiOpt)),
        }
    }

    // ── Reports ─────────────────────────────────────

    /// Offers every capability to the VTN and installs what it asks for.
    ///
    /// Returns the accepted report request ids.
    pub async fn register_reports(&mut self) -> Result<Vec<String>, OadrError> {
        if self.reports.is_empty() {
            return Ok(Vec::new());
        }
        let ven_id = self.require_ven_id()?;
        let message = Message::RegisterReport(RegisterReport {
            request_id: new_request_id(),
            ven_id: Some(ven_id.clone()),
            reports: self.reports.capabilities().to_vec(),
        });
        let registered = match self.link.exchange(Service::EiReport, &message).await {
            Some(Message::RegisteredReport(registered)) => registered,
            Some(other) => return Err(unexpected(&other)),
            None => return Err(OadrError::NoReply(Service::EiReport)),
        };
        ensure_ok(&registered.response)?;

        let accepted = self.install_requests(&registered.report_requests);
        if !accepted.is_empty() {
            let created = Message::CreatedReport(CreatedReport {
                response: ResponseStatus::ok(None),
                ven_id: Some(ven_id),
                pending_reports: accepted.clone(),
            });
            self.link.exchange(Service::EiReport, &created).await;
        }
        Ok(accepted)
    }

    fn install_requests(&mut self, requests: &[ReportRequest]) -> Vec<String> {
        let mut accepted = Vec::new();
        for request in requests {
            let Some(active) = self.reports.accept_request(request) else {
                continue;
            };
            tracing::info!(
                report_request_id = %active.report_request_id,
                "reporting {} r_id(s) every {:?}",
                active.r_ids.len(),
                active.job_interval()
            );
            if self.running {
                self.scheduler.add_job(
                    VenJob::Report(active.report_request_id.clone()),
                    Schedule::every(active.job_interval()),
                );
            }
            accepted.push(active.report_request_id);
        }
        accepted
    }

    /// Runs one collection for a report request.
    ///
    /// Returns whether a complete report was queued for delivery.
    pub async fn collect_report(&mut self, report_request_id: &str) -> bool {
        let Some(plan) = self.reports.collection_plan(report_request_id, now()) else {
            tracing::warn!(%report_request_id, "collection for unknown report request");
            return false;
        };
        let mut samples = Vec::with_capacity(plan.len());
        for job in plan {
            let values = sample(&job).await;
            samples.push((job.r_id, values));
        }

        let Some(delivery) = self.reports.ingest(report_request_id, samples, now()) else {
            return false;
        };
        let Some(ven_id) = self.ven_id().map(str::to_string) else {
            tracing::warn!(%report_request_id, "report complete but not registered, dropping it");
            return false;
        };
        if self.outbox_tx.send(Outgoing { ven_id, delivery }).is_err() {
            tracing::warn!(%report_request_id, "report queue closed, dropping report");
            return false;
        }
        true
    }

    /// Delivers queued reports inline. Only used when not running.
    ///
    /// Returns how many were sent.
    pub async fn flush_reports(&mut self) -> usize {
        let Some(mut outbox) = self.outbox_rx.take() else {
            return 0;
        };
        let mut sent = 0;
        while let Ok(outgoing) = outbox.try_recv() {
            sent += 1;
            if let Some(cancel) = deliver_report(&self.link, outgoing).await {
                self.handle_piggybacked_cancel(cancel).await;
            }
        }
        self.outbox_rx = Some(outbox);
        sent
    }

    fn cancel_reports(&mut self, cancel: &CancelReport) -> CanceledReport {
        for id in &cancel.report_request_ids {
            if self.reports.cancel(id) {
                tracing::info!(report_request_id = %id, "report cancelled by VTN");
            } else {
                tracing::warn!(report_request_id = %id, "VTN cancelled an unknown report");
            }
            self.scheduler.remove_job(&VenJob::Report(id.clone()));
        }
        CanceledReport {
            response: ResponseStatus::ok(Some(cancel.request_id.clone())),
            ven_id: self.ven_id().map(str::to_string),
            pending_reports: self.reports.request_ids(),
        }
    }

    pub(super) async fn handle_piggybacked_cancel(&mut self, cancel: CancelReport) {
        let reply = Message::CanceledReport(self.cancel_reports(&cancel));
        self.link.exchange(Service::EiReport, &reply).await;
    }

    // ── Running ─────────────────────────────────────

    /// Spawns the event loop: register, then poll and report on schedule.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(self) -> VenHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<VenCommand>(16);
        let stats = self.stats();
        let task = tokio::spawn(super::r#loop::ven_loop(self, cmd_rx));
        VenHandle {
            cmd_tx,
            task,
            stats,
        }
    }

    pub(super) fn link(&self) -> Link<T> {
        self.link.clone()
    }

    pub(super) fn take_outbox(&mut self) -> Option<mpsc::UnboundedReceiver<Outgoing>> {
        self.outbox_rx.take()
    }

    pub(super) fn take_fired(&mut self) -> Option<mpsc::UnboundedReceiver<VenJob>> {
        self.fired_rx.take()
    }

    /// Installs the periodic jobs.
    pub(super) fn start(&mut self) {
        self.running = true;
        self.schedule_poll();
        self.scheduler.add_job(
            VenJob::EventCleanup,
            Schedule::every(self.config.event_cleanup_interval),
        );
        for id in self.reports.request_ids() {
            if let Some(request) = self.reports.request(&id) {
                let schedule = Schedule::every(request.job_interval());
                self.scheduler.add_job(VenJob::Report(id), schedule);
            }
        }
    }

    pub(super) fn stop(&mut self) {
        self.running = false;
        self.scheduler.shutdown();
        self.state = VenState::Stopped;
    }

    pub(super) fn snapshot(&self) -> VenSnapshot {
        VenSnapshot {
            state: self.state,
            registration: self.registration.clone(),
            event_ids: self
                .intake
                .events()
                .iter()
                .map(|e| e.event_id.clone())
                .collect(),
            report_request_ids: self.reports.request_ids(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use oadr_transport::OadrTransportError;

    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::event::{ActivePeriod, EventSignal, SignalInterval};
    use crate::message::Profile;
    use crate::transport::mock::MockTransport;
    use crate::types::{add_duration, SignalName, SignalType};

    fn vtn_side() -> EnvelopeCodec {
        EnvelopeCodec::new(Arc::new(MsgPackCodec))
    }

    fn sealed(message: Message) -> Result<Vec<u8>, OadrTransportError> {
        Ok(vtn_side().seal(&message).unwrap())
    }

    fn created_registration(poll: Option<Duration>) -> Message {
        Message::CreatedPartyRegistration(CreatedPartyRegistration {
            response: ResponseStatus::ok(None),
            vtn_id: "vtn".into(),
            ven_id: Some("ven-1".into()),
            registration_id: Some("reg-1".into()),
            profiles: vec![Profile::default()],
            requested_poll_freq: poll,
        })
    }

    fn client(mock: &Arc<MockTransport>) -> VenClient<Arc<MockTransport>> {
        VenClient::new(VenConfig::new("test-ven"), Arc::clone(mock), Arc::new(MsgPackCodec))
    }

    fn future_event(id: &str) -> Event {
        Event::builder()
            .event_id(id)
            .active_period(ActivePeriod::new(
                add_duration(now(), Duration::from_secs(3600)),
                Duration::from_secs(600),
            ))
            .signal(EventSignal::new(
                SignalName::Simple,
                SignalType::Level,
                vec![SignalInterval::new(0, Duration::from_secs(600), 1.0)],
            ))
            .target(Target::ven_id("ven-1"))
            .build()
            .unwrap()
    }

    async fn registered(mock: &Arc<MockTransport>) -> VenClient<Arc<MockTransport>> {
        mock.push_reply(sealed(created_registration(None)));
        let mut ven = client(mock);
        ven.register_party().await.unwrap();
        ven
    }

    #[tokio::test]
    async fn registration_caps_poll_frequency() {
        let mock = Arc::new(MockTransport::new());
        mock.push_reply(sealed(created_registration(Some(Duration::from_secs(48 * 3600)))));
        let mut ven = client(&mock);

        let registration = ven.register_party().await.unwrap();
        assert_eq!(registration.poll_frequency, Duration::from_secs(24 * 3600));
        assert_eq!(registration.ven_id, "ven-1");
        assert_eq!(ven.state(), VenState::Registered);
        assert_eq!(mock.sent_services(), vec![Service::EiRegisterParty]);
    }

    #[tokio::test]
    async fn registration_without_ids_fails() {
        let mock = Arc::new(MockTransport::new());
        let mut reply = created_registration(None);
        if let Message::CreatedPartyRegistration(created) = &mut reply {
            created.registration_id = None;
        }
        mock.push_reply(sealed(reply));
        let mut ven = client(&mock);

        assert!(matches!(ven.register_party().await, Err(OadrError::NotRegistered)));
        assert_eq!(ven.state(), VenState::Unregistered);
        assert!(ven.registration().is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_no_message() {
        let mock = Arc::new(MockTransport::new());
        let mut ven = registered(&mock).await;
        mock.push_reply(Err(OadrTransportError::Status {
            url: "http://vtn/OadrPoll".into(),
            status: 500,
            body: String::new(),
        }));

        assert_eq!(ven.poll().await.unwrap(), 0);
        assert_eq!(ven.stats().transport_failures.get(), 1);
    }

    #[tokio::test]
    async fn poll_before_registration_is_an_error() {
        let mock = Arc::new(MockTransport::new());
        let mut ven = client(&mock);
        assert!(matches!(ven.poll().await, Err(OadrError::NotRegistered)));
        assert!(mock.sent_services().is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_opts_out() {
        let mock = Arc::new(MockTransport::new());
        let mut ven = registered(&mock)
            .await
            .on_event(|_| -> Reply<Result<OptType, HandlerError>> { panic!("boom") });

        mock.push_reply(sealed(Message::DistributeEvent(DistributeEvent::new(
            "vtn",
            vec![future_event("e1")],
        ))));
        mock.push_reply(sealed(Message::empty_response(None)));

        let decided = ven.request_event(None).await.unwrap();
        assert_eq!(decided, vec![("e1".to_string(), OptType::OptOut)]);
        assert_eq!(ven.decision("e1"), Some(OptType::OptOut));
        assert_eq!(ven.stats().event_responses_sent.get(), 1);
    }

    #[tokio::test]
    async fn failing_and_silent_handlers_opt_out() {
        let mock = Arc::new(MockTransport::new());
        let mut ven = registered(&mock)
            .await
            .on_event(|event| {
                if event.event_id == "fails" {
                    Reply::ready(Err(HandlerError("no capacity".into())))
                } else {
                    let (tx, reply) = Reply::channel();
                    drop(tx);
                    reply
                }
            });

        mock.push_reply(sealed(Message::DistributeEvent(DistributeEvent::new(
            "vtn",
            vec![future_event("fails"), future_event("silent")],
        ))));
        mock.push_reply(sealed(Message::empty_response(None)));

        let decided = ven.request_event(None).await.unwrap();
        assert!(decided.iter().all(|(_, opt)| *opt == OptType::OptOut));
        assert_eq!(decided.len(), 2);
    }

    #[tokio::test]
    async fn resend_does_not_call_handler_again() {
        let mock = Arc::new(MockTransport::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut ven = registered(&mock).await.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Reply::future(async { Ok(OptType::OptIn) })
        });

        for _ in 0..2 {
            mock.push_reply(sealed(Message::DistributeEvent(DistributeEvent::new(
                "vtn",
                vec![future_event("e1")],
            ))));
            mock.push_reply(sealed(Message::empty_response(None)));
            let decided = ven.request_event(None).await.unwrap();
            assert_eq!(decided, vec![("e1".to_string(), OptType::OptIn)]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn sent_event_responses(mock: &MockTransport) -> Vec<(String, u32, OptType)> {
        mock.sent
            .lock()
            .iter()
            .filter_map(|(_, body)| match vtn_side().open(body, None).unwrap().message {
                Message::CreatedEvent(created) => Some(created.event_responses),
                _ => None,
            })
            .flatten()
            .map(|r| (r.event_id, r.modification_number, r.opt_type))
            .collect()
    }

    #[tokio::test]
    async fn modified_event_keeps_decision_without_update_handler() {
        let mock = Arc::new(MockTransport::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut ven = registered(&mock).await.on_event(move |_| {
            // A second call would flip the answer.
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::ready(Ok(OptType::OptIn))
            } else {
                Reply::ready(Ok(OptType::OptOut))
            }
        });

        let original = future_event("e1");
        let mut modified = original.clone();
        modified.increment_modification();
        for event in [original, modified] {
            mock.push_reply(sealed(Message::DistributeEvent(DistributeEvent::new(
                "vtn",
                vec![event],
            ))));
            mock.push_reply(sealed(Message::empty_response(None)));
            let decided = ven.request_event(None).await.unwrap();
            assert_eq!(decided, vec![("e1".to_string(), OptType::OptIn)]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ven.decision("e1"), Some(OptType::OptIn));
        assert_eq!(
            sent_event_responses(&mock),
            vec![
                ("e1".to_string(), 0, OptType::OptIn),
                ("e1".to_string(), 1, OptType::OptIn),
            ]
        );
    }

    #[tokio::test]
    async fn older_modification_is_not_answered() {
        let mock = Arc::new(MockTransport::new());
        let mut ven = registered(&mock)
            .await
            .on_event(|_| Reply::ready(Ok(OptType::OptIn)))
            .on_update_event(|_| Reply::ready(Ok(OptType::OptOut)));

        let original = future_event("e1");
        let mut modified = original.clone();
        modified.increment_modification();

        mock.push_reply(sealed(Message::DistributeEvent(DistributeEvent::new(
            "vtn",
            vec![modified],
        ))));
        mock.push_reply(sealed(Message::empty_response(None)));
        ven.request_event(None).await.unwrap();

        mock.push_reply(sealed(Message::DistributeEvent(DistributeEvent::new(
            "vtn",
            vec![original],
        ))));
        let decided = ven.request_event(None).await.unwrap();

        assert!(decided.is_empty());
        assert_eq!(ven.decision("e1"), Some(OptType::OptIn));
        assert_eq!(ven.events()[0].modification_number, 1);
        assert_eq!(
            sent_event_responses(&mock),
            vec![("e1".to_string(), 1, OptType::OptIn)]
        );
    }

    #[tokio::test]
    async fn cancel_party_registration_from_poll_stops_draining() {
        let mock = Arc::new(MockTransport::new());
        let mut ven = registered(&mock).await;

        mock.push_reply(sealed(Message::CancelPartyRegistration(CancelPartyRegistration {
            request_id: "r".into(),
            registration_id: "reg-1".into(),
            ven_id: "ven-1".into(),
        })));
        mock.push_reply(sealed(Message::empty_response(None)));

        assert_eq!(ven.poll().await.unwrap(), 1);
        assert_eq!(ven.state(), VenState::Unregistered);
        assert!(ven.registration().is_none());
        assert_eq!(
            mock.sent_services(),
            vec![Service::EiRegisterParty, Service::OadrPoll, Service::EiRegisterParty]
        );
    }
}
