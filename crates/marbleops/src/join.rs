use crate::properties::{optional_names, optional_u64};
use futures::future::{ready, try_join_all};
use futures::stream::{self, Stream, StreamExt};
use marblecore::{
    until_error, Element, ElementId, FlowStream, FlowValue, GraphError, StageCategory, StageType,
    Value,
};
use marbleruntime::{Arity, NestedPipelines, OperatorFactory, ResolvedPipeline, StageSegment};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Stages that start a pipeline by combining several nested pipelines.
pub struct JoinFactory;

impl OperatorFactory for JoinFactory {
    fn category(&self) -> StageCategory {
        StageCategory::JoinCreation
    }

    fn stage_types(&self) -> &[StageType] {
        &[
            StageType::Merge,
            StageType::Concat,
            StageType::Race,
            StageType::Zip,
            StageType::CombineLatest,
            StageType::ForkJoin,
        ]
    }

    fn create(&self, element: &Element, nested: NestedPipelines) -> Result<StageSegment, GraphError> {
        let stage_type = element.stage_type;
        let element_id = element.id.clone();

        if matches!(stage_type, StageType::CombineLatest | StageType::ForkJoin) {
            let names = optional_names(element, "names")?;
            let inputs: Arc<Vec<(String, ResolvedPipeline)>> =
                Arc::new(nested.named(names.as_deref())?.into_iter().collect());
            return Ok(StageSegment::Source(Arc::new(move || {
                let joined = if stage_type == StageType::ForkJoin {
                    fork_join(element_id.clone(), &inputs)
                } else {
                    CombineLatest::new(element_id.clone(), &inputs).boxed()
                };
                until_error(joined)
            })));
        }

        let arity = match optional_u64(element, "inputs")? {
            Some(0) => {
                return Err(GraphError::invalid_property(&element.id, "inputs", "must be positive"))
            }
            Some(n) => Arity::Exactly(n as usize),
            None => Arity::AtLeast(1),
        };
        let inputs: Arc<[ResolvedPipeline]> = nested.ordered(arity)?.into();
        let generator = match stage_type {
            StageType::Merge | StageType::Concat | StageType::Race | StageType::Zip => {
                Arc::new(move || {
                    let joined = match stage_type {
                        StageType::Merge => {
                            stream::select_all(inputs.iter().map(ResolvedPipeline::subscribe)).boxed()
                        }
                        StageType::Concat => stream::iter(inputs.to_vec())
                            .flat_map(|pipeline| pipeline.subscribe())
                            .boxed(),
                        StageType::Race => Race::new(&inputs).boxed(),
                        _ => Zip::new(element_id.clone(), &inputs).boxed(),
                    };
                    until_error(joined)
                })
            }
            other => {
                return Err(GraphError::UnsupportedStage {
                    element_id,
                    stage_type: other.to_string(),
                })
            }
        };
        Ok(StageSegment::Source(generator))
    }
}

/// Mirrors whichever input emits or completes first.
struct Race {
    contenders: Vec<FlowStream>,
    winner: Option<FlowStream>,
}

impl Race {
    fn new(inputs: &[ResolvedPipeline]) -> Self {
        Self {
            contenders: inputs.iter().map(ResolvedPipeline::subscribe).collect(),
            winner: None,
        }
    }
}

impl Stream for Race {
    type Item = FlowValue;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FlowValue>> {
        let this = self.get_mut();
        if let Some(winner) = this.winner.as_mut() {
            return winner.poll_next_unpin(cx);
        }
        for i in 0..this.contenders.len() {
            match this.contenders[i].poll_next_unpin(cx) {
                Poll::Ready(Some(item)) => {
                    let winner = this.contenders.swap_remove(i);
                    this.contenders.clear();
                    this.winner = Some(winner);
                    return Poll::Ready(Some(item));
                }
                Poll::Ready(None) => {
                    this.contenders.clear();
                    return Poll::Ready(None);
                }
                Poll::Pending => {}
            }
        }
        if this.contenders.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

/// Pairs the n-th values of every input into an array. Completes as soon as
/// an input completes with nothing left to pair.
struct Zip {
    element_id: ElementId,
    inputs: Vec<FlowStream>,
    buffers: Vec<VecDeque<FlowValue>>,
    completed: Vec<bool>,
    finished: bool,
}

impl Zip {
    fn new(element_id: ElementId, inputs: &[ResolvedPipeline]) -> Self {
        Self {
            element_id,
            inputs: inputs.iter().map(ResolvedPipeline::subscribe).collect(),
            buffers: inputs.iter().map(|_| VecDeque::new()).collect(),
            completed: vec![false; inputs.len()],
            finished: false,
        }
    }
}

impl Stream for Zip {
    type Item = FlowValue;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FlowValue>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        for i in 0..this.inputs.len() {
            if this.completed[i] || !this.buffers[i].is_empty() {
                continue;
            }
            match this.inputs[i].poll_next_unpin(cx) {
                Poll::Ready(Some(item)) if item.is_error() => {
                    this.finished = true;
                    return Poll::Ready(Some(item));
                }
                Poll::Ready(Some(item)) => this.buffers[i].push_back(item),
                Poll::Ready(None) => this.completed[i] = true,
                Poll::Pending => {}
            }
        }

        if this.buffers.iter().all(|b| !b.is_empty()) {
            let values = this
                .buffers
                .iter_mut()
                .filter_map(|b| b.pop_front())
                .map(|item| item.value)
                .collect();
            return Poll::Ready(Some(FlowValue::next(this.element_id.as_str(), Value::Array(values))));
        }
        let exhausted = this
            .completed
            .iter()
            .zip(&this.buffers)
            .any(|(done, buffer)| *done && buffer.is_empty());
        if exhausted {
            this.finished = true;
            this.inputs.clear();
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

/// Emits an object of the latest value per name whenever an input emits,
/// once every input has emitted at least once.
struct CombineLatest {
    element_id: ElementId,
    names: Vec<String>,
    inputs: Vec<FlowStream>,
    latest: Vec<Option<Value>>,
    completed: Vec<bool>,
}

impl CombineLatest {
    fn new(element_id: ElementId, inputs: &[(String, ResolvedPipeline)]) -> Self {
        Self {
            element_id,
            names: inputs.iter().map(|(name, _)| name.clone()).collect(),
            inputs: inputs.iter().map(|(_, pipeline)| pipeline.subscribe()).collect(),
            latest: vec![None; inputs.len()],
            completed: vec![false; inputs.len()],
        }
    }

    fn snapshot(&self) -> Option<FlowValue> {
        let mut object = BTreeMap::new();
        for (name, latest) in self.names.iter().zip(&self.latest) {
            object.insert(name.clone(), latest.clone()?);
        }
        Some(FlowValue::next(self.element_id.as_str(), Value::Object(object)))
    }
}

impl Stream for CombineLatest {
    type Item = FlowValue;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FlowValue>> {
        let this = self.get_mut();
        loop {
            let mut progressed = false;
            for i in 0..this.inputs.len() {
                if this.completed[i] {
                    continue;
                }
                match this.inputs[i].poll_next_unpin(cx) {
                    Poll::Ready(Some(item)) if item.is_error() => {
                        this.completed.iter_mut().for_each(|done| *done = true);
                        return Poll::Ready(Some(item));
                    }
                    Poll::Ready(Some(item)) => {
                        this.latest[i] = Some(item.value);
                        if let Some(combined) = this.snapshot() {
                            return Poll::Ready(Some(combined));
                        }
                        progressed = true;
                    }
                    Poll::Ready(None) => {
                        this.completed[i] = true;
                        if this.latest[i].is_none() {
                            // Nothing can ever be combined.
                            this.completed.iter_mut().for_each(|done| *done = true);
                            return Poll::Ready(None);
                        }
                        progressed = true;
                    }
                    Poll::Pending => {}
                }
            }
            if this.completed.iter().all(|done| *done) {
                return Poll::Ready(None);
            }
            if !progressed {
                return Poll::Pending;
            }
        }
    }
}

/// Waits for every input to complete and emits an object of their last
/// values. An input completing empty completes the join without a value.
fn fork_join(element_id: ElementId, inputs: &[(String, ResolvedPipeline)]) -> FlowStream {
    let lasts = inputs.iter().map(|(name, pipeline)| {
        let name = name.clone();
        let mut stream = pipeline.subscribe();
        async move {
            let mut last = None;
            while let Some(item) = stream.next().await {
                if item.is_error() {
                    return Err(item);
                }
                last = Some(item.value);
            }
            Ok((name, last))
        }
    });
    let joined = try_join_all(lasts);

    stream::once(async move {
        match joined.await {
            Ok(lasts) => lasts
                .into_iter()
                .map(|(name, last)| last.map(|value| (name, value)))
                .collect::<Option<BTreeMap<_, _>>>()
                .map(|object| FlowValue::next(element_id.as_str(), Value::Object(object))),
            Err(error) => Some(error),
        }
    })
    .filter_map(ready)
    .boxed()
}
