//! Simulation runtime
//!
//! Turns a graph document into a runnable pipeline: the decomposer splits the
//! graph into branches, the compiler builds them in dependency order through
//! the registered operator factories, and the flow manager turns every
//! instrumented edge crossing into simulation events.

mod compiler;
mod decomposer;
mod flow_manager;
mod model;
mod registry;
mod simulation;

pub use compiler::{CompiledPipeline, PipelineCompiler};
pub use decomposer::GraphDecomposer;
pub use flow_manager::{FlowManager, TrackedEdge};
pub use model::{EdgeKind, GraphBranch, GraphEdge, GraphNode, SimulationModel};
pub use registry::{
    Arity, FactoryRegistry, NestedPipelines, OperatorFactory, OperatorFn, ResolvedPipeline,
    StageSegment, SubscribeHook,
};
pub use simulation::{
    Simulation, SimulationConfig, SimulationHandle, SimulationOutcome, SimulationStatus,
};
