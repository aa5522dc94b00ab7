//! Test outcome events and the listeners that receive them.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use crate::address::TestDescription;
use crate::error::{ExamResult, TestFailure};
use crate::wire::write_frame;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestEvent {
    Started {
        description: TestDescription,
        at: DateTime<Utc>,
    },
    Succeeded {
        description: TestDescription,
        at: DateTime<Utc>,
    },
    Failed {
        description: TestDescription,
        failure: TestFailure,
        at: DateTime<Utc>,
    },
}

impl TestEvent {
    pub fn started(description: TestDescription) -> Self {
        TestEvent::Started {
            description,
            at: Utc::now(),
        }
    }

    pub fn succeeded(description: TestDescription) -> Self {
        TestEvent::Succeeded {
            description,
            at: Utc::now(),
        }
    }

    pub fn failed(description: TestDescription, failure: TestFailure) -> Self {
        TestEvent::Failed {
            description,
            failure,
            at: Utc::now(),
        }
    }

    pub fn description(&self) -> &TestDescription {
        match self {
            TestEvent::Started { description, .. }
            | TestEvent::Succeeded { description, .. }
            | TestEvent::Failed { description, .. } => description,
        }
    }

    /// Whether this event ends a test.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TestEvent::Started { .. })
    }

    pub fn dispatch(&self, listener: &dyn TestListener) {
        match self {
            TestEvent::Started { description, .. } => listener.test_started(description),
            TestEvent::Succeeded { description, .. } => listener.test_succeeded(description),
            TestEvent::Failed {
                description,
                failure,
                ..
            } => listener.test_failed(description, failure),
        }
    }
}

/// Receives outcome notifications for one running test.
pub trait TestListener: Send + Sync {
    fn test_started(&self, description: &TestDescription);
    fn test_succeeded(&self, description: &TestDescription);
    fn test_failed(&self, description: &TestDescription, failure: &TestFailure);
}

/// Listener that records every event it sees.
#[derive(Debug, Default)]
pub struct CollectingListener {
    events: Mutex<Vec<TestEvent>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TestEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// The failure of the last terminal event, if it failed.
    pub fn failure(&self) -> Option<TestFailure> {
        self.events().into_iter().rev().find_map(|e| match e {
            TestEvent::Failed { failure, .. } => Some(failure),
            _ => None,
        })
    }

    fn record(&self, event: TestEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl TestListener for CollectingListener {
    fn test_started(&self, description: &TestDescription) {
        self.record(TestEvent::started(description.clone()));
    }

    fn test_succeeded(&self, description: &TestDescription) {
        self.record(TestEvent::succeeded(description.clone()));
    }

    fn test_failed(&self, description: &TestDescription, failure: &TestFailure) {
        self.record(TestEvent::failed(description.clone(), failure.clone()));
    }
}

/// Sends events to a listener socket on the local host.
pub struct EventNotifier {
    stream: TcpStream,
}

impl EventNotifier {
    pub async fn connect(port: u16) -> ExamResult<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        debug!(port, "connected to test listener");
        Ok(Self { stream })
    }

    pub async fn send(&mut self, event: &TestEvent) -> ExamResult<()> {
        write_frame(&mut self.stream, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> TestDescription {
        TestDescription {
            identifier: "Probekit-1".into(),
            caption: "acme.StoreTest.probe".into(),
        }
    }

    #[test]
    fn test_dispatch_reaches_listener() {
        let listener = CollectingListener::new();
        TestEvent::started(description()).dispatch(&listener);
        TestEvent::failed(description(), TestFailure::assertion("boom")).dispatch(&listener);

        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert!(!events[0].is_terminal());
        assert!(events[1].is_terminal());
        assert_eq!(listener.failure().unwrap().message, "boom");
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(TestEvent::succeeded(description())).unwrap();
        assert_eq!(json["type"], "succeeded");
        assert_eq!(json["description"]["identifier"], "Probekit-1");
    }
}
