//! Demand-response events: status derivation, modification tracking and
//! delivery ordering.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::target::{group_targets, reconcile_targets, Target, TargetsByType};
use crate::types::{
    add_duration, elapsed, now, EventStatus, ResponseRequired, SignalName, SignalType,
};

/// Market context used when the operator does not name one.
pub const UNKNOWN_MARKET_CONTEXT: &str = "oadr://unknown.context";

/// The window during which an event's signals apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePeriod {
    pub dtstart: DateTime<Utc>,
    pub duration: Duration,
    pub ramp_up_period: Option<Duration>,
    pub tolerance: Option<Duration>,
    pub notification_period: Option<Duration>,
    pub recovery_period: Option<Duration>,
}

impl ActivePeriod {
    pub fn new(dtstart: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            dtstart,
            duration,
            ramp_up_period: None,
            tolerance: None,
            notification_period: None,
            recovery_period: None,
        }
    }

    pub fn with_ramp_up(mut self, ramp_up: Duration) -> Self {
        self.ramp_up_period = Some(ramp_up);
        self
    }

    pub fn end(&self) -> DateTime<Utc> {
        add_duration(self.dtstart, self.duration)
    }
}

/// Time-based status of an active period at `now`.
///
/// Never returns `none` or `cancelled`: cancellation is an explicit
/// transition carried by the event itself.
pub fn derive_status(now: DateTime<Utc>, period: &ActivePeriod) -> EventStatus {
    if now >= period.end() {
        EventStatus::Completed
    } else if now >= period.dtstart {
        EventStatus::Active
    } else if elapsed(now, period.dtstart) <= period.ramp_up_period.unwrap_or(Duration::ZERO) {
        EventStatus::Near
    } else {
        EventStatus::Far
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInterval {
    /// Absolute start; when absent the interval follows the previous one.
    pub dtstart: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub uid: u32,
    pub payload: f64,
}

impl SignalInterval {
    pub fn new(uid: u32, duration: Duration, payload: f64) -> Self {
        Self {
            dtstart: None,
            duration,
            uid,
            payload,
        }
    }

    pub fn starting_at(mut self, dtstart: DateTime<Utc>) -> Self {
        self.dtstart = Some(dtstart);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSignal {
    pub signal_id: String,
    pub signal_name: SignalName,
    pub signal_type: SignalType,
    pub intervals: Vec<SignalInterval>,
    pub targets: Vec<Target>,
    pub current_value: Option<f64>,
}

impl EventSignal {
    pub fn new(
        signal_name: SignalName,
        signal_type: SignalType,
        intervals: Vec<SignalInterval>,
    ) -> Self {
        Self {
            signal_id: uuid::Uuid::new_v4().to_string(),
            signal_name,
            signal_type,
            intervals,
            targets: Vec::new(),
            current_value: None,
        }
    }

    /// Builds a signal from wire strings, rejecting unknown enumeration values.
    pub fn parse(
        signal_name: &str,
        signal_type: &str,
        intervals: Vec<SignalInterval>,
    ) -> Result<Self, ValidationError> {
        Ok(Self::new(signal_name.parse()?, signal_type.parse()?, intervals))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.signal_name.validate()?;
        self.signal_type.validate()?;
        if self.intervals.is_empty() {
            return Err(ValidationError::NoIntervals {
                signal_id: self.signal_id.clone(),
            });
        }
        Ok(())
    }
}

/// One demand-response instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub modification_number: u32,
    pub modification_reason: Option<String>,
    pub market_context: String,
    /// Lower is more urgent. Zero means no priority.
    pub priority: u32,
    pub created_date_time: DateTime<Utc>,
    /// Last status communicated on the wire. Only `cancelled` is authoritative.
    pub event_status: EventStatus,
    pub test_event: bool,
    pub vtn_comment: Option<String>,
    pub active_period: ActivePeriod,
    pub signals: Vec<EventSignal>,
    pub targets: Vec<Target>,
    pub response_required: ResponseRequired,
}

impl Event {
    pub fn builder() -> EventBuilder {
        EventBuilder::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.event_status == EventStatus::Cancelled
    }

    /// Status at `now`. Cancellation overrides the time-derived value.
    pub fn status_at(&self, now: DateTime<Utc>) -> EventStatus {
        if self.is_cancelled() {
            EventStatus::Cancelled
        } else {
            derive_status(now, &self.active_period)
        }
    }

    /// Recomputes `event_status`, returning whether it changed.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) -> bool {
        let status = self.status_at(now);
        let changed = status != self.event_status;
        self.event_status = status;
        changed
    }

    pub fn is_terminal_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now).is_terminal()
    }

    /// Marks a content change after initial distribution.
    pub fn increment_modification(&mut self) {
        self.modification_number = self.modification_number.saturating_add(1);
    }

    /// Explicit cancellation. Counts as a modification.
    pub fn cancel(&mut self) {
        self.event_status = EventStatus::Cancelled;
        self.modification_reason = Some("cancelled".into());
        self.increment_modification();
    }

    pub fn targets_by_type(&self) -> TargetsByType {
        group_targets(&self.targets)
    }
}

/// Orders events for presentation to a VEN.
///
/// Active events come first, by ascending priority with unset priority
/// last. The rest follow by ascending start time. The sort is stable.
/// Statuses are refreshed against `now` on the way.
pub fn order_events(mut events: Vec<Event>, now: DateTime<Utc>) -> Vec<Event> {
    for event in &mut events {
        event.refresh_status(now);
    }
    events.sort_by(|a, b| compare_for_delivery(a, b, now));
    events
}

fn compare_for_delivery(a: &Event, b: &Event, now: DateTime<Utc>) -> Ordering {
    let a_active = a.status_at(now) == EventStatus::Active;
    let b_active = b.status_at(now) == EventStatus::Active;
    match (a_active, b_active) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => priority_key(a.priority).cmp(&priority_key(b.priority)),
        (false, false) => a.active_period.dtstart.cmp(&b.active_period.dtstart),
    }
}

fn priority_key(priority: u32) -> u64 {
    match priority {
        0 => u64::MAX,
        p => u64::from(p),
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Validating constructor for [`Event`].
#[derive(Debug, Default)]
pub struct EventBuilder {
    event_id: Option<String>,
    market_context: Option<String>,
    priority: u32,
    response_required: Option<ResponseRequired>,
    active_period: Option<ActivePeriod>,
    ramp_up_period: Option<Duration>,
    signals: Vec<EventSignal>,
    targets: Option<Vec<Target>>,
    targets_by_type: Option<TargetsByType>,
    test_event: bool,
    vtn_comment: Option<String>,
    created_date_time: Option<DateTime<Utc>>,
}

impl EventBuilder {
    pub fn event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    pub fn market_context(mut self, context: impl Into<String>) -> Self {
        self.market_context = Some(context.into());
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn response_required(mut self, required: ResponseRequired) -> Self {
        self.response_required = Some(required);
        self
    }

    pub fn active_period(mut self, period: ActivePeriod) -> Self {
        self.active_period = Some(period);
        self
    }

    pub fn ramp_up_period(mut self, ramp_up: Duration) -> Self {
        self.ramp_up_period = Some(ramp_up);
        self
    }

    pub fn signal(mut self, signal: EventSignal) -> Self {
        self.signals.push(signal);
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.targets.get_or_insert_with(Vec::new).push(target);
        self
    }

    pub fn targets(mut self, targets: Vec<Target>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn targets_by_type(mut self, by_type: TargetsByType) -> Self {
        self.targets_by_type = Some(by_type);
        self
    }

    pub fn test_event(mut self, test: bool) -> Self {
        self.test_event = test;
        self
    }

    pub fn vtn_comment(mut self, comment: impl Into<String>) -> Self {
        self.vtn_comment = Some(comment.into());
        self
    }

    pub fn created_date_time(mut self, created: DateTime<Utc>) -> Self {
        self.created_date_time = Some(created);
        self
    }

    pub fn build(self) -> Result<Event, ValidationError> {
        let targets = reconcile_targets(self.targets, self.targets_by_type)?;
        if self.signals.is_empty() {
            return Err(ValidationError::NoSignals);
        }
        for signal in &self.signals {
            signal.validate()?;
        }

        let mut active_period = match self.active_period {
            Some(period) => period,
            None => period_from_signals(&self.signals)?,
        };
        if self.ramp_up_period.is_some() {
            active_period.ramp_up_period = self.ramp_up_period;
        }

        let created = self.created_date_time.unwrap_or_else(now);
        let mut event = Event {
            event_id: self
                .event_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            modification_number: 0,
            modification_reason: None,
            market_context: self
                .market_context
                .unwrap_or_else(|| UNKNOWN_MARKET_CONTEXT.to_string()),
            priority: self.priority,
            created_date_time: created,
            event_status: EventStatus::None,
            test_event: self.test_event,
            vtn_comment: self.vtn_comment,
            active_period,
            signals: self.signals,
            targets,
            response_required: self.response_required.unwrap_or(ResponseRequired::Always),
        };
        event.refresh_status(now());
        Ok(event)
    }
}

/// Active period spanning the first signal's intervals.
fn period_from_signals(signals: &[EventSignal]) -> Result<ActivePeriod, ValidationError> {
    let first = &signals[0];
    let dtstart = first
        .intervals
        .first()
        .and_then(|i| i.dtstart)
        .ok_or_else(|| ValidationError::MissingStart {
            signal_id: first.signal_id.clone(),
        })?;
    let duration = first
        .intervals
        .iter()
        .fold(Duration::ZERO, |acc, i| acc.saturating_add(i.duration));
    Ok(ActivePeriod::new(dtstart, duration))
}
