//! VEN engine: registration, polling, event decisions and report delivery.
//!
//! [`VenClient`] can be driven step by step (`register_party`, `poll`,
//! `register_reports`, ...) or handed to [`VenClient::run`], which spawns
//! the event loop and returns a [`VenHandle`].

mod client;
mod events;
mod r#loop;
mod reports;

use std::sync::Arc;
use std::time::Duration;

use oadr_metrics::Counter;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::envelope::Keypair;
use crate::error::OadrError;
use crate::event::Event;
use crate::replay::DEFAULT_MAX_SKEW;
use crate::reply::Reply;
use crate::types::OptType;

pub use client::VenClient;
pub use events::{event_responses, EventIntake, Intake};
pub use reports::{
    ActiveRequest, ReportCollector, ReportDefinition, SampleCallback, SampleJob, SampleRequest,
};

/// Poll frequency used when the VTN does not ask for one.
pub const DEFAULT_POLL_FREQUENCY: Duration = Duration::from_secs(10);

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for a VEN engine.
#[derive(Debug, Clone)]
pub struct VenConfig {
    /// Name sent with the registration request.
    pub ven_name: String,
    /// Pre-provisioned VEN id. The VTN's value wins if they differ.
    pub ven_id: Option<String>,
    /// Fingerprint the VTN's signatures must match. `None` accepts any signer.
    pub vtn_fingerprint: Option<String>,
    /// Signing key for outgoing messages.
    pub keypair: Option<Keypair>,
    /// Spread polls randomly within the poll interval.
    pub allow_jitter: bool,
    /// How often finished events are dropped from memory.
    pub event_cleanup_interval: Duration,
    /// Upper bound on the poll frequency the VTN may request.
    pub max_poll_interval: Duration,
    /// Replay protection window for incoming signatures.
    pub replay_window: Duration,
    pub profile_name: String,
    pub transport_name: String,
    pub transport_address: Option<String>,
    pub http_pull_model: bool,
    pub report_only: bool,
    /// Stop draining after this many messages in a single poll cycle.
    pub max_messages_per_poll: usize,
}

impl Default for VenConfig {
    fn default() -> Self {
        Self {
            ven_name: "ven".to_string(),
            ven_id: None,
            vtn_fingerprint: None,
            keypair: None,
            allow_jitter: true,
            event_cleanup_interval: Duration::from_secs(300),
            max_poll_interval: Duration::from_secs(24 * 3600),
            replay_window: DEFAULT_MAX_SKEW,
            profile_name: "2.0b".to_string(),
            transport_name: "simpleHttp".to_string(),
            transport_address: None,
            http_pull_model: true,
            report_only: false,
            max_messages_per_poll: 1000,
        }
    }
}

impl VenConfig {
    pub fn new(ven_name: impl Into<String>) -> Self {
        Self {
            ven_name: ven_name.into(),
            ..Self::default()
        }
    }
}

// ── Operator callbacks ────────────────────────────────────────────────

/// Failure reported by an event callback. Treated as an opt-out.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Decides whether the VEN takes part in an event.
pub type EventHandler = Arc<dyn Fn(&Event) -> Reply<Result<OptType, HandlerError>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct VenHandlers {
    pub on_event: Option<EventHandler>,
    pub on_update_event: Option<EventHandler>,
}

// ── State ─────────────────────────────────────────────────────────────

/// Registration lifecycle of a VEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VenState {
    Unregistered,
    Registering,
    Registered,
    Polling,
    Stopped,
}

/// What the VTN handed out at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub ven_id: String,
    pub registration_id: String,
    pub poll_frequency: Duration,
    pub vtn_id: String,
}

/// Activity counters of a VEN engine.
#[derive(Debug, Default, Serialize)]
pub struct VenStats {
    pub polls: Counter,
    pub messages_received: Counter,
    pub events_received: Counter,
    pub event_responses_sent: Counter,
    pub reports_sent: Counter,
    pub transport_failures: Counter,
    pub messages_rejected: Counter,
}

impl VenStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Running engine ────────────────────────────────────────────────────

/// Periodic work of a running VEN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum VenJob {
    Poll,
    EventCleanup,
    Report(String),
}

pub(crate) enum VenCommand {
    Snapshot { reply: oneshot::Sender<VenSnapshot> },
    Shutdown,
}

/// Point-in-time view of a running VEN.
#[derive(Debug, Clone, Serialize)]
pub struct VenSnapshot {
    pub state: VenState,
    pub registration: Option<Registration>,
    pub event_ids: Vec<String>,
    pub report_request_ids: Vec<String>,
}

/// Handle to a VEN spawned with [`VenClient::run`].
pub struct VenHandle {
    cmd_tx: mpsc::Sender<VenCommand>,
    task: JoinHandle<()>,
    stats: Arc<VenStats>,
}

impl VenHandle {
    pub fn stats(&self) -> Arc<VenStats> {
        Arc::clone(&self.stats)
    }

    pub async fn snapshot(&self) -> Result<VenSnapshot, OadrError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(VenCommand::Snapshot { reply: tx })
            .await
            .map_err(|_| OadrError::Shutdown)?;
        rx.await.map_err(|_| OadrError::Shutdown)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops polling and reporting and waits for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(VenCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!("VEN task ended abnormally: {e}");
        }
    }
}
