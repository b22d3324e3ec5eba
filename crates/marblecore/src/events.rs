//! Event records reported to the animation layer while a simulation runs.

use crate::flow::ValueId;
use crate::graph::{ConnectLineId, ElementId};
use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One observed crossing (or summarised run of crossings) of the graph.
///
/// `source_element_id` and `target_element_id` are the ends of the first and
/// last edge of the reported path; `connect_lines_id` lists every edge of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SimulationEvent {
    #[serde(rename_all = "camelCase")]
    Value {
        id: ValueId,
        index: u64,
        hash: String,
        value: Value,
        connect_lines_id: Vec<ConnectLineId>,
        source_element_id: ElementId,
        target_element_id: ElementId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        id: ValueId,
        index: u64,
        hash: String,
        error: Value,
        connect_lines_id: Vec<ConnectLineId>,
        source_element_id: ElementId,
        target_element_id: ElementId,
        timestamp: DateTime<Utc>,
    },
    /// Last event of a run: an error nobody caught.
    #[serde(rename_all = "camelCase")]
    Fatal {
        id: ValueId,
        index: u64,
        hash: String,
        error: Value,
        connect_line_id: ConnectLineId,
        connect_lines_id: Vec<ConnectLineId>,
        source_element_id: ElementId,
        target_element_id: ElementId,
        timestamp: DateTime<Utc>,
    },
}

impl SimulationEvent {
    pub fn value_id(&self) -> ValueId {
        match self {
            SimulationEvent::Value { id, .. }
            | SimulationEvent::Error { id, .. }
            | SimulationEvent::Fatal { id, .. } => *id,
        }
    }

    pub fn index(&self) -> u64 {
        match self {
            SimulationEvent::Value { index, .. }
            | SimulationEvent::Error { index, .. }
            | SimulationEvent::Fatal { index, .. } => *index,
        }
    }

    pub fn connect_lines_id(&self) -> &[ConnectLineId] {
        match self {
            SimulationEvent::Value {
                connect_lines_id, ..
            }
            | SimulationEvent::Error {
                connect_lines_id, ..
            }
            | SimulationEvent::Fatal {
                connect_lines_id, ..
            } => connect_lines_id,
        }
    }

    pub fn source_element_id(&self) -> &str {
        match self {
            SimulationEvent::Value {
                source_element_id, ..
            }
            | SimulationEvent::Error {
                source_element_id, ..
            }
            | SimulationEvent::Fatal {
                source_element_id, ..
            } => source_element_id,
        }
    }

    pub fn target_element_id(&self) -> &str {
        match self {
            SimulationEvent::Value {
                target_element_id, ..
            }
            | SimulationEvent::Error {
                target_element_id, ..
            }
            | SimulationEvent::Fatal {
                target_element_id, ..
            } => target_element_id,
        }
    }

    /// Payload for value events, error for error and fatal events.
    pub fn payload(&self) -> &Value {
        match self {
            SimulationEvent::Value { value, .. } => value,
            SimulationEvent::Error { error, .. } | SimulationEvent::Fatal { error, .. } => error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SimulationEvent::Fatal { .. })
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<SimulationEvent>;

/// Sending half of the ordered event stream.
///
/// Buffering is unbounded: the consumer is an animation layer that may lag
/// arbitrarily behind a synchronous pipeline.
pub struct EventBus {
    sender: mpsc::UnboundedSender<SimulationEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: SimulationEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event receiver dropped, discarding simulation event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn value_event(index: u64) -> SimulationEvent {
        SimulationEvent::Value {
            id: Uuid::new_v4(),
            index,
            hash: Value::from(1).fingerprint(),
            value: Value::from(1),
            connect_lines_id: vec!["l1".to_string()],
            source_element_id: "a".to_string(),
            target_element_id: "b".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let json = serde_json::to_value(value_event(7)).unwrap();

        assert_eq!(json["type"], "value");
        assert_eq!(json["index"], 7);
        assert_eq!(json["connectLinesId"][0], "l1");
        assert_eq!(json["sourceElementId"], "a");
        assert_eq!(json["targetElementId"], "b");
    }

    #[test]
    fn channel_closes_when_bus_is_dropped() {
        let (bus, mut receiver) = EventBus::channel();
        bus.emit(value_event(0));
        drop(bus);

        assert!(receiver.try_recv().is_ok());
        assert!(matches!(
            receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
