//! Query state machine
//!
//! Pure transition logic for a single query instance. The machine performs
//! no side effects: callers observe the returned [`Transition`] and drive
//! cache writes and promise settlement from it.
//!
//! ```text
//! idle --request--> fetching --fetchSuccessful--> success --invalidate--> idle
//!                       |                                                  ^
//!                       +--fetchFailed--> error --invalidate---------------+
//!                                           |
//!                                           +--retry--> fetching
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// The externally visible status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Idle,
    Fetching,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events accepted by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryEvent {
    Request,
    FetchSuccessful,
    FetchFailed,
    Invalidate,
    Retry,
}

/// A state change produced by [`QueryStateMachine::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: QueryStatus,
    pub to: QueryStatus,
    pub event: QueryEvent,
}

/// Transition table for the query lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStateMachine {
    status: QueryStatus,
}

impl QueryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Compute the next status, or `None` if the event is not legal from `status`.
    pub fn next(status: QueryStatus, event: QueryEvent) -> Option<QueryStatus> {
        use QueryEvent as E;
        use QueryStatus as S;

        match (status, event) {
            (S::Idle, E::Request) => Some(S::Fetching),
            (S::Fetching, E::FetchSuccessful) => Some(S::Success),
            (S::Fetching, E::FetchFailed) => Some(S::Error),
            (S::Success, E::Invalidate) => Some(S::Idle),
            (S::Error, E::Retry) => Some(S::Fetching),
            (S::Error, E::Invalidate) => Some(S::Idle),
            _ => None,
        }
    }

    /// Apply an event. Illegal events leave the status untouched and return `None`.
    pub fn send(&mut self, event: QueryEvent) -> Option<Transition> {
        let to = Self::next(self.status, event)?;
        let transition = Transition {
            from: self.status,
            to,
            event,
        };
        self.status = to;
        Some(transition)
    }

    /// Whether `event` would change the status.
    pub fn can(&self, event: QueryEvent) -> bool {
        Self::next(self.status, event).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_EVENTS: [QueryEvent; 5] = [
        QueryEvent::Request,
        QueryEvent::FetchSuccessful,
        QueryEvent::FetchFailed,
        QueryEvent::Invalidate,
        QueryEvent::Retry,
    ];

    #[test]
    fn test_happy_path() {
        let mut machine = QueryStateMachine::new();
        assert_eq!(machine.status(), QueryStatus::Idle);

        let t = machine.send(QueryEvent::Request).unwrap();
        assert_eq!((t.from, t.to), (QueryStatus::Idle, QueryStatus::Fetching));

        machine.send(QueryEvent::FetchSuccessful).unwrap();
        assert_eq!(machine.status(), QueryStatus::Success);

        machine.send(QueryEvent::Invalidate).unwrap();
        assert_eq!(machine.status(), QueryStatus::Idle);
    }

    #[test]
    fn test_error_then_retry() {
        let mut machine = QueryStateMachine::new();
        machine.send(QueryEvent::Request);
        machine.send(QueryEvent::FetchFailed);
        assert_eq!(machine.status(), QueryStatus::Error);

        machine.send(QueryEvent::Retry).unwrap();
        assert_eq!(machine.status(), QueryStatus::Fetching);
    }

    #[test]
    fn test_only_request_leaves_idle() {
        for event in ALL_EVENTS {
            let legal = QueryStateMachine::next(QueryStatus::Idle, event).is_some();
            assert_eq!(legal, event == QueryEvent::Request, "{:?}", event);
        }
    }

    #[test]
    fn test_request_is_noop_outside_idle() {
        for status in [QueryStatus::Fetching, QueryStatus::Success, QueryStatus::Error] {
            assert_eq!(QueryStateMachine::next(status, QueryEvent::Request), None);
        }
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&QueryStatus::Fetching).unwrap();
        assert_eq!(json, "\"fetching\"");
        assert_eq!(QueryStatus::Error.to_string(), "error");
    }

    fn arb_event() -> impl Strategy<Value = QueryEvent> {
        prop::sample::select(ALL_EVENTS.to_vec())
    }

    proptest! {
        /// Property: retry changes state only from error.
        #[test]
        fn prop_retry_only_from_error(events in prop::collection::vec(arb_event(), 0..30)) {
            let mut machine = QueryStateMachine::new();
            for event in events {
                machine.send(event);
            }
            let before = machine.status();
            let transition = machine.send(QueryEvent::Retry);
            if before == QueryStatus::Error {
                prop_assert_eq!(machine.status(), QueryStatus::Fetching);
            } else {
                prop_assert!(transition.is_none());
                prop_assert_eq!(machine.status(), before);
            }
        }

        /// Property: rejected events never change the status.
        #[test]
        fn prop_rejected_events_are_noops(events in prop::collection::vec(arb_event(), 0..50)) {
            let mut machine = QueryStateMachine::new();
            for event in events {
                let before = machine.status();
                match machine.send(event) {
                    Some(t) => {
                        prop_assert_eq!(t.from, before);
                        prop_assert_eq!(t.to, machine.status());
                    }
                    None => prop_assert_eq!(machine.status(), before),
                }
            }
        }
    }
}
