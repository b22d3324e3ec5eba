use crate::flow_manager::{ErrorTracking, FlowManager, TrackedEdge};
use crate::model::{GraphBranch, GraphNode, SimulationModel};
use crate::registry::{
    FactoryRegistry, NestedPipelines, OperatorFn, ResolvedPipeline, StageSegment, SubscribeHook,
};
use marblecore::{ElementId, FlowStream, GraphError, PipelineGenerator, SimulationSettings};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;

/// The runnable result of compiling a graph.
///
/// Compiling never subscribes: call [`subscribe`](Self::subscribe) to get a
/// stream and poll it to run the simulation.
#[derive(Clone)]
pub struct CompiledPipeline {
    root: ElementId,
    generator: PipelineGenerator,
    flow: FlowManager,
    settings: SimulationSettings,
}

impl CompiledPipeline {
    pub fn root(&self) -> &str {
        &self.root
    }

    /// A fresh, not yet running, stream over the whole pipeline.
    pub fn subscribe(&self) -> FlowStream {
        (self.generator)()
    }

    pub fn flow(&self) -> &FlowManager {
        &self.flow
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }
}

/// One direct edge of a branch and the stage behind it.
struct BranchStep {
    edge: Arc<TrackedEdge>,
    tracking: ErrorTracking,
    /// `None` when the edge ends at a subscriber.
    operator: Option<OperatorFn>,
}

/// Compiles branches in dependency order into one instrumented pipeline.
pub struct PipelineCompiler {
    registry: Arc<FactoryRegistry>,
    flow: FlowManager,
}

impl PipelineCompiler {
    pub fn new(registry: Arc<FactoryRegistry>, flow: FlowManager) -> Self {
        Self { registry, flow }
    }

    pub fn compile(&self, model: &SimulationModel) -> Result<CompiledPipeline, GraphError> {
        let order = Self::dependency_order(model)?;
        tracing::debug!(?order, "compiling branches");

        let mut compiled: HashMap<ElementId, PipelineGenerator> = HashMap::new();
        for entry in order {
            let branch = model.branch(&entry)?;
            let generator = self.compile_branch(model, branch, &compiled)?;
            compiled.insert(entry, generator);
        }

        let root = model.root().clone();
        let generator = compiled
            .remove(&root)
            .ok_or_else(|| GraphError::BranchNotFound(root.clone()))?;
        tracing::info!(root = %root, "pipeline compiled");

        Ok(CompiledPipeline {
            root,
            generator,
            flow: self.flow.clone(),
            settings: model.settings().clone(),
        })
    }

    /// Entry ids ordered so every branch comes after the branches it
    /// references.
    fn dependency_order(model: &SimulationModel) -> Result<Vec<ElementId>, GraphError> {
        let mut graph: DiGraph<ElementId, ()> = DiGraph::new();
        let mut index: HashMap<&ElementId, NodeIndex> = HashMap::new();

        let mut entries: Vec<&ElementId> = model.branches().keys().collect();
        entries.sort();
        for entry in &entries {
            index.insert(*entry, graph.add_node((*entry).clone()));
        }
        for entry in &entries {
            let branch = model.branch(entry)?;
            for dependency in &branch.references {
                let from = index
                    .get(dependency)
                    .ok_or_else(|| GraphError::BranchNotFound(dependency.clone()))?;
                graph.add_edge(*from, index[*entry], ());
            }
        }

        toposort(&graph, None)
            .map(|order| order.into_iter().map(|i| graph[i].clone()).collect())
            .map_err(|cycle| GraphError::DependencyCycle {
                element_id: graph[cycle.node_id()].clone(),
            })
    }

    fn compile_branch(
        &self,
        model: &SimulationModel,
        branch: &GraphBranch,
        compiled: &HashMap<ElementId, PipelineGenerator>,
    ) -> Result<PipelineGenerator, GraphError> {
        let is_main = branch.entry == *model.root();
        let source = match self.create_segment(model, &branch.nodes[0], compiled)? {
            StageSegment::Source(generator) => generator,
            StageSegment::Operator(_) => {
                return Err(GraphError::NotAnEntryStage {
                    element_id: branch.entry.clone(),
                })
            }
        };

        let mut steps = Vec::new();
        for (from, edge, to) in branch.hops() {
            let target = model.element(&to.element_id)?;
            let tracked = Arc::new(TrackedEdge::direct(
                edge.connect_line_id.clone(),
                &from.element_id,
                target,
            ));
            let (tracking, operator) = if target.stage_type.is_terminal() {
                let tracking = if is_main {
                    ErrorTracking::Unhandled
                } else {
                    ErrorTracking::Tracked
                };
                (tracking, None)
            } else {
                match self.create_segment(model, to, compiled)? {
                    StageSegment::Operator(op) => (ErrorTracking::Tracked, Some(op)),
                    StageSegment::Source(_) => {
                        return Err(GraphError::UnsupportedStage {
                            element_id: target.id.clone(),
                            stage_type: target.stage_type.to_string(),
                        })
                    }
                }
            };
            steps.push(BranchStep {
                edge: tracked,
                tracking,
                operator,
            });
        }
        tracing::debug!(entry = %branch.entry, hops = steps.len(), "branch compiled");

        let flow = self.flow.clone();
        let steps = Arc::new(steps);
        Ok(Arc::new(move || {
            let mut stream = source();
            for step in steps.iter() {
                stream = flow.instrument(stream, step.edge.clone(), step.tracking);
                if let Some(operator) = &step.operator {
                    stream = operator(stream);
                }
            }
            stream
        }))
    }

    /// Resolve the nested pipelines `node` references and hand the stage to
    /// its factory.
    fn create_segment(
        &self,
        model: &SimulationModel,
        node: &GraphNode,
        compiled: &HashMap<ElementId, PipelineGenerator>,
    ) -> Result<StageSegment, GraphError> {
        let element = model.element(&node.element_id)?;

        let mut pipelines = Vec::new();
        for edge in node.reference_edges() {
            let line = model.connect_line(&edge.connect_line_id)?;
            let nested = compiled
                .get(&edge.target)
                .cloned()
                .ok_or_else(|| GraphError::BranchNotFound(edge.target.clone()))?;
            let exit = &model.branch(&edge.target)?.terminal().element_id;
            let tracked = Arc::new(TrackedEdge::reference(line.id.clone(), exit, element));

            let flow = self.flow.clone();
            let reference = tracked.clone();
            let generator: PipelineGenerator = Arc::new(move || {
                flow.instrument(nested(), reference.clone(), ErrorTracking::Tracked)
            });
            let flow = self.flow.clone();
            let on_subscribe: SubscribeHook = Arc::new(move || flow.handle_subscribe(&tracked));

            pipelines.push(
                ResolvedPipeline::new(line.clone(), generator).with_on_subscribe(on_subscribe),
            );
        }

        self.registry
            .create_segment(element, NestedPipelines::new(element.id.clone(), pipelines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Arity, OperatorFactory};
    use futures::executor::block_on;
    use futures::stream::{self, StreamExt};
    use marblecore::{
        ConnectLine, Element, EventBus, EventReceiver, FlowValue, GraphDocument, SimulationEvent,
        StageCategory, StageType, Value,
    };

    /// `of` emits its values, `map` passes through, `merge` chains its
    /// inputs one after another.
    struct TestFactory;

    impl OperatorFactory for TestFactory {
        fn category(&self) -> StageCategory {
            StageCategory::Creation
        }

        fn stage_types(&self) -> &[StageType] {
            &[StageType::Of, StageType::Map, StageType::Merge]
        }

        fn create(
            &self,
            element: &Element,
            nested: NestedPipelines,
        ) -> Result<StageSegment, GraphError> {
            match element.stage_type {
                StageType::Of => {
                    nested.none()?;
                    let id = element.id.clone();
                    let values = element
                        .property("values")
                        .and_then(Value::as_array)
                        .map(<[Value]>::to_vec)
                        .unwrap_or_default();
                    Ok(StageSegment::Source(Arc::new(move || {
                        let items: Vec<_> =
                            values.iter().map(|v| FlowValue::next(id.as_str(), v.clone())).collect();
                        stream::iter(items).boxed()
                    })))
                }
                StageType::Map => {
                    nested.none()?;
                    Ok(StageSegment::Operator(Arc::new(|upstream| upstream)))
                }
                _ => {
                    let inputs = nested.ordered(Arity::AtLeast(1))?;
                    Ok(StageSegment::Source(Arc::new(move || {
                        stream::iter(inputs.clone())
                            .flat_map(|p| p.subscribe())
                            .boxed()
                    })))
                }
            }
        }
    }

    fn init_tracing() {
        use tracing_subscriber::{fmt, EnvFilter};
        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    }

    fn compile(doc: &GraphDocument) -> Result<(CompiledPipeline, EventReceiver), GraphError> {
        init_tracing();
        let mut registry = FactoryRegistry::new();
        registry.register(Arc::new(TestFactory));
        let (bus, events) = EventBus::channel();
        let model = SimulationModel::from_document(doc)?;
        let pipeline = PipelineCompiler::new(Arc::new(registry), FlowManager::new(bus)).compile(&model)?;
        Ok((pipeline, events))
    }

    fn drain(receiver: &mut EventReceiver) -> Vec<SimulationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn merged() -> GraphDocument {
        let mut doc = GraphDocument::new("merged");
        doc.add_element(Element::new("root", StageType::Merge));
        doc.add_element(Element::new("a", StageType::Of).with_property("values", vec![1, 2]));
        doc.add_element(Element::new("b", StageType::Of).with_property("values", vec![10]));
        doc.add_element(Element::new("sink", StageType::Subscriber));
        doc.connect("out", "root", "sink");
        doc.add_connect_line(ConnectLine::new("ra", "root", "a").with_index(0));
        doc.add_connect_line(ConnectLine::new("rb", "root", "b").with_index(1));
        doc
    }

    #[test]
    fn nested_branches_compile_before_their_consumer() {
        let model = SimulationModel::from_document(&merged()).unwrap();
        let order = PipelineCompiler::dependency_order(&model).unwrap();

        let position = |id: &str| order.iter().position(|e| e == id).unwrap();
        assert!(position("a") < position("root"));
        assert!(position("b") < position("root"));
    }

    #[test]
    fn reference_cycle_aborts_compilation() {
        let mut doc = GraphDocument::new("cycle").with_root("m1");
        doc.add_element(Element::new("m1", StageType::Merge));
        doc.add_element(Element::new("m2", StageType::Merge));
        doc.add_element(Element::new("sink", StageType::Subscriber));
        doc.connect("out", "m1", "sink");
        doc.connect("r1", "m1", "m2");
        doc.connect("r2", "m2", "m1");

        let err = compile(&doc).err().unwrap();
        assert!(matches!(err, GraphError::DependencyCycle { .. }));
    }

    #[test]
    fn unsupported_stage_aborts_compilation() {
        let mut doc = GraphDocument::new("unsupported");
        doc.add_element(Element::new("src", StageType::Of).with_property("values", vec![1]));
        doc.add_element(Element::new("f", StageType::Filter));
        doc.add_element(Element::new("sink", StageType::Subscriber));
        doc.connect("l1", "src", "f");
        doc.connect("l2", "f", "sink");

        let err = compile(&doc).err().unwrap();
        assert_eq!(err.element_id(), Some("f"));
    }

    #[test]
    fn compiling_does_not_subscribe() {
        let (pipeline, mut events) = compile(&merged()).unwrap();

        assert!(drain(&mut events).is_empty());
        assert_eq!(pipeline.flow().activations(), 0);
    }

    #[test]
    fn nested_values_are_reported_with_their_reference_edge() {
        let (pipeline, mut events) = compile(&merged()).unwrap();
        let values: Vec<_> = block_on(pipeline.subscribe().collect());

        assert_eq!(values.len(), 3);
        let events = drain(&mut events);
        assert_eq!(events.len(), 3);
        for event in &events {
            assert_eq!(event.target_element_id(), "sink");
            assert_eq!(event.connect_lines_id().len(), 2);
            assert_eq!(event.connect_lines_id()[1], "out");
        }
        assert_eq!(events[0].source_element_id(), "a");
        assert_eq!(events[0].connect_lines_id()[0], "ra");
        assert_eq!(events[2].source_element_id(), "b");
        assert_eq!(pipeline.flow().activations(), 2);
        assert_eq!(pipeline.flow().open_paths(), 0);
    }

    #[test]
    fn linear_chain_reports_every_hop() {
        let mut doc = GraphDocument::new("linear");
        doc.add_element(Element::new("src", StageType::Of).with_property("values", vec![1]));
        doc.add_element(Element::new("m1", StageType::Map));
        doc.add_element(Element::new("m2", StageType::Map));
        doc.add_element(Element::new("sink", StageType::Subscriber));
        doc.connect("l1", "src", "m1");
        doc.connect("l2", "m1", "m2");
        doc.connect("l3", "m2", "sink");

        let (pipeline, mut events) = compile(&doc).unwrap();
        block_on(pipeline.subscribe().collect::<Vec<_>>());

        let hops: Vec<_> = drain(&mut events)
            .iter()
            .map(|e| (e.source_element_id().to_string(), e.target_element_id().to_string()))
            .collect();
        assert_eq!(
            hops,
            vec![
                ("src".to_string(), "m1".to_string()),
                ("m1".to_string(), "m2".to_string()),
                ("m2".to_string(), "sink".to_string()),
            ]
        );
    }
}
