use futures::stream::{self, StreamExt};
use marblecore::{
    ConnectLine, Element, ElementId, FlowStream, GraphError, PipelineGenerator, StageCategory,
    StageType,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Applies a stage to the stream coming from upstream.
pub type OperatorFn = Arc<dyn Fn(FlowStream) -> FlowStream + Send + Sync>;

/// Called when a nested pipeline is actually activated.
pub type SubscribeHook = Arc<dyn Fn() + Send + Sync>;

/// What a factory turns a stage into.
pub enum StageSegment {
    /// Entry stages: produce a fresh stream on demand.
    Source(PipelineGenerator),
    /// Stages with exactly one upstream.
    Operator(OperatorFn),
}

/// A nested pipeline ready to be consumed by its parent stage.
#[derive(Clone)]
pub struct ResolvedPipeline {
    pub connect_line: ConnectLine,
    pub generator: PipelineGenerator,
    pub on_subscribe: SubscribeHook,
}

impl ResolvedPipeline {
    pub fn new(connect_line: ConnectLine, generator: PipelineGenerator) -> Self {
        Self {
            connect_line,
            generator,
            on_subscribe: Arc::new(|| {}),
        }
    }

    pub fn with_on_subscribe(mut self, hook: SubscribeHook) -> Self {
        self.on_subscribe = hook;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.connect_line.name.as_deref()
    }

    /// A stream over this pipeline. Nothing runs, and the subscribe hook is
    /// not called, until the stream is first polled.
    pub fn subscribe(&self) -> FlowStream {
        let generator = self.generator.clone();
        let hook = self.on_subscribe.clone();
        stream::once(async move {
            hook();
            generator()
        })
        .flatten()
        .boxed()
    }
}

impl std::fmt::Debug for ResolvedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedPipeline")
            .field("connect_line", &self.connect_line.id)
            .field("index", &self.connect_line.index)
            .field("name", &self.connect_line.name)
            .finish()
    }
}

/// How many nested pipelines a stage accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "exactly {}", n),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

/// The nested pipelines resolved for one stage, sorted by edge index.
pub struct NestedPipelines {
    element_id: ElementId,
    pipelines: Vec<ResolvedPipeline>,
}

impl NestedPipelines {
    pub fn new(element_id: impl Into<ElementId>, mut pipelines: Vec<ResolvedPipeline>) -> Self {
        pipelines.sort_by(|a, b| {
            (a.connect_line.index, &a.connect_line.id).cmp(&(b.connect_line.index, &b.connect_line.id))
        });
        Self {
            element_id: element_id.into(),
            pipelines,
        }
    }

    pub fn empty(element_id: impl Into<ElementId>) -> Self {
        Self::new(element_id, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// For stages that consume their inputs by position.
    pub fn ordered(self, arity: Arity) -> Result<Vec<ResolvedPipeline>, GraphError> {
        let actual = self.pipelines.len();
        let (minimum, maximum) = match arity {
            Arity::Exactly(n) => (n, Some(n)),
            Arity::AtLeast(n) => (n, None),
        };
        if actual < minimum {
            return Err(GraphError::MissingReferencePipeline {
                element_id: self.element_id,
                reference: format!("#{}", actual),
            });
        }
        if maximum.is_some_and(|max| actual > max) {
            return Err(GraphError::ReferenceArity {
                element_id: self.element_id,
                expected: arity.to_string(),
                actual,
            });
        }
        Ok(self.pipelines)
    }

    /// For stages that consume their inputs by name. With `expected`, the
    /// set of names must match exactly.
    pub fn named(
        self,
        expected: Option<&[String]>,
    ) -> Result<BTreeMap<String, ResolvedPipeline>, GraphError> {
        let actual = self.pipelines.len();
        let mut named = BTreeMap::new();
        for pipeline in self.pipelines {
            let name = pipeline
                .name()
                .map(str::to_string)
                .ok_or_else(|| GraphError::UnnamedReference {
                    element_id: self.element_id.clone(),
                    connect_line_id: pipeline.connect_line.id.clone(),
                })?;
            if named.insert(name, pipeline).is_some() {
                return Err(GraphError::ReferenceArity {
                    element_id: self.element_id,
                    expected: "uniquely named references".to_string(),
                    actual,
                });
            }
        }

        match expected {
            Some(names) => {
                if let Some(missing) = names.iter().find(|n| !named.contains_key(*n)) {
                    return Err(GraphError::MissingReferencePipeline {
                        element_id: self.element_id,
                        reference: missing.clone(),
                    });
                }
                if named.len() > names.len() {
                    return Err(GraphError::ReferenceArity {
                        element_id: self.element_id,
                        expected: names.join(", "),
                        actual,
                    });
                }
            }
            None if named.is_empty() => {
                return Err(GraphError::MissingReferencePipeline {
                    element_id: self.element_id,
                    reference: "#0".to_string(),
                });
            }
            None => {}
        }
        Ok(named)
    }

    /// For stages that need exactly one nested pipeline.
    pub fn single(self) -> Result<ResolvedPipeline, GraphError> {
        let element_id = self.element_id.clone();
        self.ordered(Arity::Exactly(1))?
            .pop()
            .ok_or(GraphError::MissingReferencePipeline {
                element_id,
                reference: "#0".to_string(),
            })
    }

    /// For stages that take no nested pipeline at all.
    pub fn none(self) -> Result<(), GraphError> {
        self.ordered(Arity::Exactly(0)).map(|_| ())
    }
}

/// One family of stages that can be turned into stream segments.
pub trait OperatorFactory: Send + Sync {
    fn category(&self) -> StageCategory;

    /// Stage types this factory builds.
    fn stage_types(&self) -> &[StageType];

    fn is_supported(&self, element: &Element) -> bool {
        self.stage_types().contains(&element.stage_type)
    }

    /// Build the segment for `element`. Expressions are compiled and nested
    /// pipeline arity is checked here, so a graph either compiles completely
    /// or not at all.
    fn create(&self, element: &Element, nested: NestedPipelines)
        -> Result<StageSegment, GraphError>;
}

/// Registry of operator factory families
pub struct FactoryRegistry {
    factories: Vec<Arc<dyn OperatorFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn OperatorFactory>) {
        tracing::info!(
            "Registering {:?} factory ({} stage types)",
            factory.category(),
            factory.stage_types().len()
        );
        self.factories.push(factory);
    }

    pub fn supports(&self, element: &Element) -> bool {
        self.factories.iter().any(|f| f.is_supported(element))
    }

    pub fn create_segment(
        &self,
        element: &Element,
        nested: NestedPipelines,
    ) -> Result<StageSegment, GraphError> {
        let factory = self
            .factories
            .iter()
            .find(|f| f.is_supported(element))
            .ok_or_else(|| GraphError::UnsupportedStage {
                element_id: element.id.clone(),
                stage_type: element.stage_type.to_string(),
            })?;
        factory.create(element, nested)
    }

    /// Every buildable stage type with its family.
    pub fn list_stage_types(&self) -> Vec<(StageCategory, StageType)> {
        self.factories
            .iter()
            .flat_map(|f| f.stage_types().iter().map(move |t| (f.category(), *t)))
            .collect()
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
