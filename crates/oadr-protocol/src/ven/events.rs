//! Event intake: which events a VEN has seen and what it decided.
//!
//! Pure state with no I/O. The client asks [`EventIntake::receive`] how
//! to treat an incoming event, runs the right callback, and records the
//! outcome.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::event::Event;
use crate::message::EventResponse;
use crate::types::{EventStatus, OptType, ResponseCode, ResponseRequired};

/// How an incoming event relates to what was already received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    /// Never seen this `event_id`.
    New,
    /// Same `event_id` and `modification_number`.
    Resend { previous: Option<OptType> },
    /// Same `event_id`, higher `modification_number`.
    Updated { previous: Option<OptType> },
    /// Same `event_id`, lower `modification_number` than the stored copy.
    Stale,
}

#[derive(Debug, Default)]
pub struct EventIntake {
    received: Vec<Event>,
    decisions: HashMap<String, OptType>,
}

impl EventIntake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, event: &Event) -> Intake {
        let previous = self.decisions.get(&event.event_id).copied();
        match self.get(&event.event_id) {
            None => Intake::New,
            Some(known) if known.modification_number == event.modification_number => {
                Intake::Resend { previous }
            }
            Some(known) if known.modification_number > event.modification_number => Intake::Stale,
            Some(_) => Intake::Updated { previous },
        }
    }

    /// Classifies `event` and stores it, replacing any older copy.
    ///
    /// A stale copy is not stored.
    pub fn receive(&mut self, event: &Event) -> Intake {
        let intake = self.classify(event);
        if intake == Intake::Stale {
            return intake;
        }
        match self
            .received
            .iter_mut()
            .find(|known| known.event_id == event.event_id)
        {
            Some(known) => *known = event.clone(),
            None => self.received.push(event.clone()),
        }
        intake
    }

    /// Stores the decision for `event`, or drops it once the event is over.
    pub fn record_decision(&mut self, event: &Event, opt: OptType, now: DateTime<Utc>) {
        if event.is_terminal_at(now) {
            self.decisions.remove(&event.event_id);
        } else {
            self.decisions.insert(event.event_id.clone(), opt);
        }
    }

    pub fn decision(&self, event_id: &str) -> Option<OptType> {
        self.decisions.get(event_id).copied()
    }

    pub fn get(&self, event_id: &str) -> Option<&Event> {
        self.received.iter().find(|e| e.event_id == event_id)
    }

    pub fn events(&self) -> &[Event] {
        &self.received
    }

    pub fn len(&self) -> usize {
        self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    /// Forgets cancelled and completed events. Returns their ids.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut removed = Vec::new();
        self.received.retain(|event| {
            if event.is_terminal_at(now) {
                removed.push(event.event_id.clone());
                false
            } else {
                true
            }
        });
        for id in &removed {
            self.decisions.remove(id);
        }
        removed
    }
}

/// Builds the acknowledgement entries for a batch of decisions.
///
/// Only events asking for a response, and not already completed, are included.
pub fn event_responses(
    decided: &[(Event, OptType)],
    request_id: &str,
    now: DateTime<Utc>,
) -> Vec<EventResponse> {
    decided
        .iter()
        .filter(|(event, _)| {
            event.response_required == ResponseRequired::Always
                && event.status_at(now) != EventStatus::Completed
        })
        .map(|(event, opt)| EventResponse {
            code: ResponseCode::Ok,
            description: ResponseCode::Ok.description().to_string(),
            request_id: request_id.to_string(),
            event_id: event.event_id.clone(),
            modification_number: event.modification_number,
            opt_type: *opt,
        })
        .collect()
}
