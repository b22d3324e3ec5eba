use chrono::Utc;
use futures::StreamExt;
use marblecore::{
    ConnectLineId, Element, ElementId, EventBus, FlowStream, FlowValue, SimulationEvent, ValueId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One instrumented edge as seen by the flow manager.
///
/// `from_element_id` / `to_element_id` follow the direction values travel,
/// which for reference edges is the reverse of the drawn connect line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEdge {
    pub connect_line_id: ConnectLineId,
    pub from_element_id: ElementId,
    pub to_element_id: ElementId,
    /// Errors crossing this edge are caught by its target.
    pub catches_errors: bool,
    /// Values crossing this edge are reported together with their next hop.
    pub holds_values: bool,
}

impl TrackedEdge {
    /// A direct edge from `from` into `to`.
    pub fn direct(connect_line_id: impl Into<ConnectLineId>, from: &str, to: &Element) -> Self {
        let catches_errors = to.stage_type.is_error_handler();
        Self {
            connect_line_id: connect_line_id.into(),
            from_element_id: from.to_string(),
            to_element_id: to.id.clone(),
            catches_errors,
            holds_values: catches_errors,
        }
    }

    /// A reference edge carrying values from a nested branch ending at
    /// `from` into its consuming stage `to`.
    pub fn reference(connect_line_id: impl Into<ConnectLineId>, from: &str, to: &Element) -> Self {
        Self {
            connect_line_id: connect_line_id.into(),
            from_element_id: from.to_string(),
            to_element_id: to.id.clone(),
            catches_errors: false,
            holds_values: to.stage_type.forwards_nested_values(),
        }
    }
}

/// Which error reporting an instrumented edge installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorTracking {
    /// The error may still be caught further down.
    Tracked,
    /// The edge into the overall subscriber: nothing can catch it anymore.
    Unhandled,
}

struct FlowState {
    paths: HashMap<ValueId, Vec<Arc<TrackedEdge>>>,
    next_index: u64,
    bus: Option<EventBus>,
    activations: u64,
}

/// Reconstructs per-value edge paths and reports them as simulation events.
///
/// Every value id opens a path the first time it crosses an edge; the path
/// is closed by exactly one emitted event. Callbacks run on whichever task
/// polls the pipeline, so the state sits behind a mutex.
#[derive(Clone)]
pub struct FlowManager {
    state: Arc<Mutex<FlowState>>,
}

enum PathEvent {
    Value,
    Error,
}

impl FlowManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(FlowState {
                paths: HashMap::new(),
                next_index: 0,
                bus: Some(bus),
                activations: 0,
            })),
        }
    }

    /// A value crossed `edge`.
    pub fn handle_next_event(&self, value: &FlowValue, edge: &Arc<TrackedEdge>) {
        let mut state = self.state.lock();
        if state.bus.is_none() {
            return;
        }
        let path = state.paths.entry(value.id).or_default();
        path.push(edge.clone());
        if edge.holds_values {
            tracing::trace!(value = %value.id, edge = %edge.connect_line_id, "holding path");
            return;
        }
        if let Some(path) = state.paths.remove(&value.id) {
            state.emit_path(PathEvent::Value, value, path);
        }
    }

    /// An error crossed `edge` and may still be caught.
    pub fn handle_error(&self, value: &FlowValue, edge: &Arc<TrackedEdge>) {
        let mut state = self.state.lock();
        if state.bus.is_none() {
            return;
        }
        state
            .paths
            .entry(value.id)
            .or_default()
            .push(edge.clone());
        if !edge.catches_errors {
            return;
        }
        if let Some(path) = state.paths.remove(&value.id) {
            state.emit_path(PathEvent::Error, value, path);
        }
    }

    /// An error reached the overall subscriber. Reports it and ends the run.
    pub fn handle_fatal_error(&self, value: &FlowValue, edge: &Arc<TrackedEdge>) {
        let mut state = self.state.lock();
        let Some(bus) = state.bus.take() else {
            return;
        };
        let mut path = state.paths.remove(&value.id).unwrap_or_default();
        path.push(edge.clone());
        let index = state.take_index();
        let first = &path[0];

        tracing::info!(
            value = %value.id,
            edge = %edge.connect_line_id,
            "unhandled error ends simulation: {}",
            value.value
        );
        bus.emit(SimulationEvent::Fatal {
            id: value.id,
            index,
            hash: value.hash.clone(),
            error: value.value.clone(),
            connect_line_id: edge.connect_line_id.clone(),
            connect_lines_id: path.iter().map(|e| e.connect_line_id.clone()).collect(),
            source_element_id: first.from_element_id.clone(),
            target_element_id: edge.to_element_id.clone(),
            timestamp: Utc::now(),
        });
        state.paths.clear();
    }

    /// A nested pipeline behind `edge` was activated.
    pub fn handle_subscribe(&self, edge: &TrackedEdge) {
        let mut state = self.state.lock();
        state.activations += 1;
        tracing::debug!(
            edge = %edge.connect_line_id,
            nested = %edge.from_element_id,
            "nested pipeline subscribed"
        );
    }

    /// Paths opened but not yet reported.
    pub fn open_paths(&self) -> usize {
        self.state.lock().paths.len()
    }

    /// How many nested pipelines have been activated so far.
    pub fn activations(&self) -> u64 {
        self.state.lock().activations
    }

    /// Whether the event stream is closed, by a fatal error or [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.state.lock().bus.is_none()
    }

    /// Drop any open path without reporting it. Used on cancellation.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.paths.is_empty() {
            tracing::debug!(open = state.paths.len(), "discarding open paths");
        }
        state.paths.clear();
    }

    /// End the event stream.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.paths.is_empty() {
            tracing::warn!(
                open = state.paths.len(),
                "closing flow manager with open paths"
            );
        }
        state.paths.clear();
        state.bus = None;
    }

    /// Report every value and error that passes through `stream` as having
    /// crossed `edge`.
    pub(crate) fn instrument(
        &self,
        stream: FlowStream,
        edge: Arc<TrackedEdge>,
        tracking: ErrorTracking,
    ) -> FlowStream {
        let flow = self.clone();
        stream
            .inspect(move |item| {
                if !item.is_error() {
                    flow.handle_next_event(item, &edge);
                } else if tracking == ErrorTracking::Unhandled {
                    flow.handle_fatal_error(item, &edge);
                } else {
                    flow.handle_error(item, &edge);
                }
            })
            .boxed()
    }
}

impl FlowState {
    fn take_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Report a closed path: first edge's source to last edge's target.
    fn emit_path(&mut self, kind: PathEvent, value: &FlowValue, path: Vec<Arc<TrackedEdge>>) {
        let (Some(first), Some(last)) = (path.first(), path.last()) else {
            return;
        };
        let source_element_id = first.from_element_id.clone();
        let target_element_id = last.to_element_id.clone();
        let connect_lines_id: Vec<ConnectLineId> =
            path.iter().map(|e| e.connect_line_id.clone()).collect();
        let index = self.take_index();

        tracing::trace!(
            value = %value.id,
            index,
            from = %source_element_id,
            to = %target_element_id,
            hops = connect_lines_id.len(),
            "flow event"
        );
        let event = match kind {
            PathEvent::Value => SimulationEvent::Value {
                id: value.id,
                index,
                hash: value.hash.clone(),
                value: value.value.clone(),
                connect_lines_id,
                source_element_id,
                target_element_id,
                timestamp: Utc::now(),
            },
            PathEvent::Error => SimulationEvent::Error {
                id: value.id,
                index,
                hash: value.hash.clone(),
                error: value.value.clone(),
                connect_lines_id,
                source_element_id,
                target_element_id,
                timestamp: Utc::now(),
            },
        };
        if let Some(bus) = &self.bus {
            bus.emit(event);
        }
    }
}
