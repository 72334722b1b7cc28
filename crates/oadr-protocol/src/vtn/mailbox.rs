//! Per-VEN mailboxes on the VTN.
//!
//! Each VEN has a set of stored events and a FIFO of other queued
//! messages. Events are redistributed as a whole, ordered for delivery,
//! whenever one of them changes. Operator code adds to the mailboxes
//! while request handlers drain them, so all access goes through one lock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::event::{order_events, Event};
use crate::message::Message;
use crate::types::add_duration;

#[derive(Debug, Default)]
struct Mailbox {
    events: Vec<Event>,
    events_updated: bool,
    queue: VecDeque<Message>,
    /// Events dropped after their final distribution, with when they went.
    completed: HashMap<String, DateTime<Utc>>,
}

impl Mailbox {
    /// Ordered events for delivery. Terminal ones go out one last time,
    /// then move to the completed set.
    ///
    /// Events held back by `limit` keep the mailbox flagged, so the next
    /// poll delivers them.
    fn take_events(&mut self, now: DateTime<Utc>, limit: Option<usize>) -> Vec<Event> {
        let ordered = order_events(std::mem::take(&mut self.events), now);
        let mut delivered = Vec::with_capacity(ordered.len());
        let mut held_back = false;
        for event in ordered {
            if limit.is_some_and(|limit| delivered.len() >= limit) {
                self.events.push(event);
                held_back = true;
                continue;
            }
            if event.is_terminal_at(now) {
                self.completed.insert(event.event_id.clone(), now);
            } else {
                self.events.push(event.clone());
            }
            delivered.push(event);
        }
        self.events_updated = held_back;
        delivered
    }
}

/// What the next poll from a VEN gets.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Events(Vec<Event>),
    Message(Message),
}

/// Where an event id stands for a VEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLookup {
    Current { modification_number: u32 },
    Completed,
    Unknown,
}

#[derive(Debug, Default)]
pub struct Mailboxes {
    inner: Mutex<HashMap<String, Mailbox>>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `event` for `ven_id`, replacing an event with the same id.
    pub fn add_event(&self, ven_id: &str, event: Event) {
        let mut inner = self.inner.lock();
        let mailbox = inner.entry(ven_id.to_string()).or_default();
        mailbox.completed.remove(&event.event_id);
        match mailbox
            .events
            .iter_mut()
            .find(|known| known.event_id == event.event_id)
        {
            Some(known) => *known = event,
            None => mailbox.events.push(event),
        }
        mailbox.events_updated = true;
    }

    /// Applies `change` to a stored event and flags the mailbox.
    ///
    /// Returns `false` when the event is not stored.
    pub fn update_event<F>(&self, ven_id: &str, event_id: &str, change: F) -> bool
    where
        F: FnOnce(&mut Event),
    {
        let mut inner = self.inner.lock();
        let Some(mailbox) = inner.get_mut(ven_id) else {
            return false;
        };
        let Some(event) = mailbox.events.iter_mut().find(|e| e.event_id == event_id) else {
            return false;
        };
        change(event);
        mailbox.events_updated = true;
        true
    }

    pub fn cancel_event(&self, ven_id: &str, event_id: &str) -> bool {
        self.update_event(ven_id, event_id, Event::cancel)
    }

    pub fn enqueue(&self, ven_id: &str, message: Message) {
        self.inner
            .lock()
            .entry(ven_id.to_string())
            .or_default()
            .queue
            .push_back(message);
    }

    /// Drops queued messages matching `predicate`. Returns how many went.
    pub fn withdraw<F>(&self, ven_id: &str, predicate: F) -> usize
    where
        F: Fn(&Message) -> bool,
    {
        let mut inner = self.inner.lock();
        let Some(mailbox) = inner.get_mut(ven_id) else {
            return 0;
        };
        let before = mailbox.queue.len();
        mailbox.queue.retain(|message| !predicate(message));
        before - mailbox.queue.len()
    }

    /// Updated events first, then queued messages in arrival order.
    pub fn next_delivery(&self, ven_id: &str, now: DateTime<Utc>) -> Option<Delivery> {
        let mut inner = self.inner.lock();
        let mailbox = inner.get_mut(ven_id)?;
        if mailbox.events_updated {
            let events = mailbox.take_events(now, None);
            if !events.is_empty() {
                return Some(Delivery::Events(events));
            }
        }
        mailbox.queue.pop_front().map(Delivery::Message)
    }

    /// Every stored event, ordered, for an explicit event request.
    pub fn pending_events(&self, ven_id: &str, now: DateTime<Utc>, limit: Option<usize>) -> Vec<Event> {
        let mut inner = self.inner.lock();
        match inner.get_mut(ven_id) {
            Some(mailbox) => mailbox.take_events(now, limit),
            None => Vec::new(),
        }
    }

    pub fn find_event(&self, ven_id: &str, event_id: &str) -> EventLookup {
        let inner = self.inner.lock();
        let Some(mailbox) = inner.get(ven_id) else {
            return EventLookup::Unknown;
        };
        if let Some(event) = mailbox.events.iter().find(|e| e.event_id == event_id) {
            EventLookup::Current {
                modification_number: event.modification_number,
            }
        } else if mailbox.completed.contains_key(event_id) {
            EventLookup::Completed
        } else {
            EventLookup::Unknown
        }
    }

    /// Recomputes event statuses. Returns the VENs whose events changed.
    pub fn refresh(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut flagged = Vec::new();
        for (ven_id, mailbox) in inner.iter_mut() {
            let mut changed = false;
            for event in &mut mailbox.events {
                changed |= event.refresh_status(now);
            }
            if changed {
                mailbox.events_updated = true;
                flagged.push(ven_id.clone());
            }
        }
        flagged.sort();
        flagged
    }

    /// Forgets completed events dropped more than `retention` before `now`.
    ///
    /// Returns the `(ven_id, event_id)` pairs forgotten. Late answers for
    /// them are refused as unknown.
    pub fn prune_completed(&self, now: DateTime<Utc>, retention: Duration) -> Vec<(String, String)> {
        let mut inner = self.inner.lock();
        let mut pruned = Vec::new();
        for (ven_id, mailbox) in inner.iter_mut() {
            mailbox.completed.retain(|event_id, dropped_at| {
                let keep = add_duration(*dropped_at, retention) > now;
                if !keep {
                    pruned.push((ven_id.clone(), event_id.clone()));
                }
                keep
            });
        }
        pruned.sort();
        pruned
    }

    pub fn completed_count(&self, ven_id: &str) -> usize {
        self.inner.lock().get(ven_id).map_or(0, |m| m.completed.len())
    }

    pub fn events(&self, ven_id: &str) -> Vec<Event> {
        self.inner
            .lock()
            .get(ven_id)
            .map(|m| m.events.clone())
            .unwrap_or_default()
    }

    pub fn queued(&self, ven_id: &str) -> usize {
        self.inner.lock().get(ven_id).map_or(0, |m| m.queue.len())
    }

    pub fn remove(&self, ven_id: &str) {
        self.inner.lock().remove(ven_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::{ActivePeriod, EventSignal, SignalInterval};
    use crate::message::RequestReregistration;
    use crate::target::Target;
    use crate::types::{SignalName, SignalType};

    fn at(offset_secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap()
    }

    fn event(id: &str, start: i64, priority: u32) -> Event {
        Event::builder()
            .event_id(id)
            .priority(priority)
            .active_period(ActivePeriod::new(at(start), Duration::from_secs(60)))
            .signal(EventSignal::new(
                SignalName::Simple,
                SignalType::Level,
                vec![SignalInterval::new(0, Duration::from_secs(60), 1.0)],
            ))
            .target(Target::ven_id("ven1"))
            .build()
            .unwrap()
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.event_id.as_str()).collect()
    }

    #[test]
    fn events_are_delivered_ordered_then_queue_drains() {
        let boxes = Mailboxes::new();
        boxes.add_event("ven1", event("later", 500, 0));
        boxes.add_event("ven1", event("running", -10, 2));
        boxes.enqueue(
            "ven1",
            Message::RequestReregistration(RequestReregistration {
                ven_id: "ven1".into(),
            }),
        );

        match boxes.next_delivery("ven1", at(0)) {
            Some(Delivery::Events(events)) => assert_eq!(ids(&events), ["running", "later"]),
            other => panic!("expected events, got {other:?}"),
        }
        assert!(matches!(
            boxes.next_delivery("ven1", at(0)),
            Some(Delivery::Message(Message::RequestReregistration(_)))
        ));
        assert_eq!(boxes.next_delivery("ven1", at(0)), None);
        assert_eq!(boxes.next_delivery("nobody", at(0)), None);
    }

    #[test]
    fn withdraw_drops_matching_queued_messages() {
        let boxes = Mailboxes::new();
        for ven_id in ["ven1", "ven2"] {
            boxes.enqueue(
                "ven1",
                Message::RequestReregistration(RequestReregistration {
                    ven_id: ven_id.into(),
                }),
            );
        }
        let removed = boxes.withdraw("ven1", |m| m.ven_id() == Some("ven2"));
        assert_eq!(removed, 1);
        assert_eq!(boxes.queued("ven1"), 1);
        assert_eq!(boxes.withdraw("nobody", |_| true), 0);
    }

    #[test]
    fn cancellation_is_redistributed_once_then_completed() {
        let boxes = Mailboxes::new();
        boxes.add_event("ven1", event("e1", 500, 0));
        boxes.next_delivery("ven1", at(0));

        assert!(boxes.cancel_event("ven1", "e1"));
        assert!(!boxes.cancel_event("ven1", "missing"));
        match boxes.next_delivery("ven1", at(0)) {
            Some(Delivery::Events(events)) => {
                assert!(events[0].is_cancelled());
                assert_eq!(events[0].modification_number, 1);
            }
            other => panic!("expected the cancellation, got {other:?}"),
        }
        assert_eq!(boxes.find_event("ven1", "e1"), EventLookup::Completed);
        assert_eq!(boxes.find_event("ven1", "e2"), EventLookup::Unknown);
        assert_eq!(boxes.next_delivery("ven1", at(0)), None);
    }

    #[test]
    fn status_refresh_flags_the_mailbox() {
        let boxes = Mailboxes::new();
        boxes.add_event("ven1", event("e1", 30, 0));
        boxes.next_delivery("ven1", at(0));
        assert_eq!(boxes.refresh(at(10)), Vec::<String>::new());
        assert_eq!(boxes.refresh(at(40)), vec!["ven1"]);
        assert!(matches!(
            boxes.next_delivery("ven1", at(40)),
            Some(Delivery::Events(_))
        ));
        assert_eq!(
            boxes.find_event("ven1", "e1"),
            EventLookup::Current {
                modification_number: 0
            }
        );
    }

    #[test]
    fn pending_events_respects_limit() {
        let boxes = Mailboxes::new();
        boxes.add_event("ven1", event("a", 100, 0));
        boxes.add_event("ven1", event("b", 200, 0));
        let first = boxes.pending_events("ven1", at(0), Some(1));
        assert_eq!(ids(&first), ["a"]);
        assert_eq!(boxes.events("ven1").len(), 2);
    }

    #[test]
    fn events_held_back_by_a_limit_go_out_on_the_next_poll() {
        let boxes = Mailboxes::new();
        boxes.add_event("ven1", event("a", 100, 0));
        boxes.add_event("ven1", event("b", 200, 0));
        assert_eq!(ids(&boxes.pending_events("ven1", at(0), Some(1))), ["a"]);

        match boxes.next_delivery("ven1", at(0)) {
            Some(Delivery::Events(events)) => assert_eq!(ids(&events), ["a", "b"]),
            other => panic!("expected the held-back event, got {other:?}"),
        }
        assert_eq!(boxes.next_delivery("ven1", at(0)), None);
    }

    #[test]
    fn completed_ids_are_forgotten_after_retention() {
        let boxes = Mailboxes::new();
        boxes.add_event("ven1", event("e1", 500, 0));
        boxes.add_event("ven2", event("e2", 500, 0));
        boxes.cancel_event("ven1", "e1");
        boxes.next_delivery("ven1", at(0));
        assert_eq!(boxes.completed_count("ven1"), 1);

        let retention = Duration::from_secs(3600);
        assert!(boxes.prune_completed(at(3599), retention).is_empty());
        assert_eq!(boxes.find_event("ven1", "e1"), EventLookup::Completed);

        let pruned = boxes.prune_completed(at(3600), retention);
        assert_eq!(pruned, vec![("ven1".to_string(), "e1".to_string())]);
        assert_eq!(boxes.completed_count("ven1"), 0);
        assert_eq!(boxes.find_event("ven1", "e1"), EventLookup::Unknown);
        assert_eq!(boxes.events("ven2").len(), 1);
    }
}
