//! Tick-stamped control tokens.
//!
//! An event remembers the scheduler tick it was created in. Consumers of
//! `#call` / `#cancel` only react to events from the current tick, so a
//! binding that re-delivers an old event (rebinding, reload) is harmless.

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

#[derive(Debug)]
struct EventData {
    kind: Arc<str>,
    tick: i64,
}

/// A trigger event. Clones share identity.
#[derive(Clone)]
pub struct Event(Arc<EventData>);

impl Event {
    pub fn new(kind: impl Into<Arc<str>>, tick: i64) -> Self {
        Self(Arc::new(EventData { kind: kind.into(), tick }))
    }

    /// The `complete` event emitted after a finished run.
    pub fn complete(tick: i64) -> Self {
        Self::new("complete", tick)
    }

    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    pub fn tick(&self) -> i64 {
        self.0.tick
    }

    /// Whether the event was created in the given scheduler tick.
    pub fn is_valid(&self, current_tick: i64) -> bool {
        self.0.tick == current_tick
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Classify a value arriving on an event-typed property.
    pub fn check(value: &Value, current_tick: i64) -> EventType {
        match value {
            Value::Undefined => EventType::Void,
            Value::Event(event) if !event.is_valid(current_tick) => EventType::Void,
            Value::Event(_) => EventType::Trigger,
            Value::Error(error) if !error.is_valid(current_tick) => EventType::Void,
            Value::Error(_) => EventType::Error,
            _ => EventType::Trigger,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event({}@{})", self.0.kind, self.0.tick)
    }
}

#[derive(Debug)]
struct ErrorData {
    kind: Arc<str>,
    message: Arc<str>,
    tick: i64,
}

/// A domain-level failure travelling through the graph as ordinary data.
#[derive(Clone)]
pub struct ErrorEvent(Arc<ErrorData>);

impl ErrorEvent {
    pub fn new(kind: impl Into<Arc<str>>, message: impl Into<Arc<str>>, tick: i64) -> Self {
        Self(Arc::new(ErrorData {
            kind: kind.into(),
            message: message.into(),
            tick,
        }))
    }

    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    pub fn tick(&self) -> i64 {
        self.0.tick
    }

    pub fn is_valid(&self, current_tick: i64) -> bool {
        self.0.tick == current_tick
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorEvent({}: {}@{})", self.0.kind, self.0.message, self.0.tick)
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0.kind, self.0.message)
    }
}

/// Result of [`Event::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Undefined, or an event from an earlier tick.
    Void,
    Trigger,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_is_only_valid_in_its_tick() {
        let event = Event::new("click", 4);
        assert!(event.is_valid(4));
        assert!(!event.is_valid(5));
    }

    #[test]
    fn check_classifies_values() {
        let tick = 10;
        assert_eq!(Event::check(&Value::Undefined, tick), EventType::Void);
        assert_eq!(Event::check(&Value::Event(Event::new("a", tick)), tick), EventType::Trigger);
        assert_eq!(Event::check(&Value::Event(Event::new("a", tick - 1)), tick), EventType::Void);
        assert_eq!(
            Event::check(&Value::Error(ErrorEvent::new("timeout", "late", tick)), tick),
            EventType::Error
        );
        assert_eq!(Event::check(&Value::from(true), tick), EventType::Trigger);
    }

    #[test]
    fn clones_share_identity() {
        let event = Event::new("a", 1);
        let other = Event::new("a", 1);
        assert!(event.ptr_eq(&event.clone()));
        assert!(!event.ptr_eq(&other));
    }
}
