use serde::Serialize;
use std::io::Write;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

/// RFC 3339 timestamp for JSONL events.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub name: String,
    pub mode: &'static str,
    pub endpoint: String,
    pub fingerprint: Option<String>,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(name: &str, mode: &'static str, endpoint: &str, fingerprint: Option<String>) -> Self {
        Self {
            event: "started",
            name: name.to_string(),
            mode,
            endpoint: endpoint.to_string(),
            fingerprint,
            timestamp: now_iso(),
        }
    }
}

// ── Protocol events ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventRegistered {
    pub event: &'static str,
    pub ven_id: String,
    pub ven_name: Option<String>,
    pub timestamp: String,
}

impl EventRegistered {
    pub fn new(ven_id: &str, ven_name: Option<String>) -> Self {
        Self {
            event: "registered",
            ven_id: ven_id.to_string(),
            ven_name,
            timestamp: now_iso(),
        }
    }
}

/// An opt decision, seen from either side.
#[derive(Serialize)]
pub struct EventOpt {
    pub event: &'static str,
    pub ven_id: String,
    pub event_id: String,
    pub opt_type: String,
    pub timestamp: String,
}

impl EventOpt {
    pub fn new(ven_id: &str, event_id: &str, opt_type: impl ToString) -> Self {
        Self {
            event: "opt",
            ven_id: ven_id.to_string(),
            event_id: event_id.to_string(),
            opt_type: opt_type.to_string(),
            timestamp: now_iso(),
        }
    }
}

#[derive(Serialize)]
pub struct EventReport {
    pub event: &'static str,
    pub ven_id: String,
    pub report_request_id: String,
    pub r_id: String,
    pub samples: usize,
    pub last_value: Option<f64>,
}

// ── Shutdown ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStopped<S: Serialize> {
    pub event: &'static str,
    pub elapsed_s: f64,
    pub stats: S,
    pub timestamp: String,
}

impl<S: Serialize> EventStopped<S> {
    pub fn new(elapsed_s: f64, stats: S) -> Self {
        Self {
            event: "stopped",
            elapsed_s,
            stats,
            timestamp: now_iso(),
        }
    }
}
