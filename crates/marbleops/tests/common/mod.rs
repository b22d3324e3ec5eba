#![allow(dead_code)]

use marblecore::{GraphDocument, SimulationEvent, Value};
use marbleops::standard_registry;
use marbleruntime::{Simulation, SimulationOutcome};
use std::sync::Arc;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn simulation() -> Simulation {
    Simulation::new(Arc::new(standard_registry()))
}

/// Run `document` to the end and return everything it reported.
pub async fn run(document: &GraphDocument) -> (SimulationOutcome, Vec<SimulationEvent>) {
    init_tracing();
    simulation()
        .start(document)
        .expect("graph should compile")
        .collect()
        .await
        .expect("simulation task should not panic")
}

/// Value events that ended at `target`.
pub fn reaching<'a>(events: &'a [SimulationEvent], target: &str) -> Vec<&'a SimulationEvent> {
    events
        .iter()
        .filter(|e| matches!(e, SimulationEvent::Value { .. }) && e.target_element_id() == target)
        .collect()
}

pub fn payloads(events: &[&SimulationEvent]) -> Vec<Value> {
    events.iter().map(|e| e.payload().clone()).collect()
}

pub fn numbers(values: &[i64]) -> Vec<Value> {
    values.iter().map(|n| Value::from(*n)).collect()
}
