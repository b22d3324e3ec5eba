//! Core abstractions for the marble simulator
//!
//! This crate provides the graph model handed over by the editor, the
//! identity-carrying values that travel through a compiled pipeline and the
//! event records reported back to the animation layer. It has no runtime
//! logic of its own.

mod error;
pub mod events;
mod flow;
mod graph;
mod value;

pub use error::{GraphError, MarbleError};
pub use events::{EventBus, EventReceiver, SimulationEvent};
pub use flow::{until_error, FlowKind, FlowStream, FlowValue, PipelineGenerator, ValueId};
pub use graph::{
    ConnectLine, ConnectLineId, ConnectPoint, Element, ElementId, GraphDocument, Position,
    SimulationSettings, StageCategory, StageType,
};
pub use value::Value;

/// Result type for marble operations
pub type Result<T> = std::result::Result<T, MarbleError>;
