use crate::expression::{Expression, ExpressionLimits, PipelineRef};
use crate::properties::{optional_i64, optional_u64, required_str, required_u64};
use futures::future::ready;
use futures::stream::{self, StreamExt};
use marblecore::{
    until_error, Element, ElementId, FlowStream, FlowValue, GraphError, PipelineGenerator,
    StageCategory, StageType, Value,
};
use marbleruntime::{Arity, NestedPipelines, OperatorFactory, ResolvedPipeline, StageSegment};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Stages that start a pipeline on their own.
pub struct CreationFactory {
    limits: ExpressionLimits,
}

impl CreationFactory {
    pub fn new(limits: ExpressionLimits) -> Self {
        Self { limits }
    }

    fn defer(&self, element: &Element, nested: NestedPipelines) -> Result<StageSegment, GraphError> {
        let expression = Expression::compile(element, required_str(element, "expression")?, &self.limits)?;
        let pipelines: Arc<[ResolvedPipeline]> = nested.ordered(Arity::AtLeast(1))?.into();
        let subscriptions = Arc::new(AtomicU64::new(0));

        Ok(StageSegment::Source(Arc::new(move || {
            let expression = expression.clone();
            let pipelines = pipelines.clone();
            let index = subscriptions.fetch_add(1, Ordering::Relaxed);
            let selected = stream::once(async move {
                let stage = expression.element_id().to_string();
                expression
                    .eval_projection(None, index)
                    .and_then(|reference| select(&pipelines, &reference))
                    .unwrap_or_else(|message| fail(&stage, message))
            });
            until_error(selected.flatten().boxed())
        })))
    }
}

impl OperatorFactory for CreationFactory {
    fn category(&self) -> StageCategory {
        StageCategory::Creation
    }

    fn stage_types(&self) -> &[StageType] {
        &[
            StageType::Of,
            StageType::From,
            StageType::Range,
            StageType::Interval,
            StageType::Timer,
            StageType::Empty,
            StageType::ThrowError,
            StageType::Defer,
        ]
    }

    fn create(&self, element: &Element, nested: NestedPipelines) -> Result<StageSegment, GraphError> {
        if element.stage_type == StageType::Defer {
            return self.defer(element, nested);
        }
        nested.none()?;
        let id = element.id.clone();

        let generator = match element.stage_type {
            StageType::Of => emit_all(id, of_values(element)?),
            StageType::From => emit_all(id, from_values(element)?),
            StageType::Range => {
                let start = optional_i64(element, "start")?.unwrap_or(0);
                let end = i64::try_from(required_u64(element, "count")?)
                    .ok()
                    .and_then(|count| start.checked_add(count))
                    .ok_or_else(|| {
                        GraphError::invalid_property(&element.id, "count", "out of range")
                    })?;
                range(id, start, end)
            }
            StageType::Interval => {
                let period = period(element, "period")?;
                ticks(id, period, Some(period))
            }
            StageType::Timer => {
                let due = Duration::from_millis(required_u64(element, "due")?);
                let period = optional_u64(element, "period")?.map(Duration::from_millis);
                if period.is_some_and(|p| p.is_zero()) {
                    return Err(GraphError::invalid_property(&element.id, "period", "must be positive"));
                }
                ticks(id, due, period)
            }
            StageType::Empty => emit_all(id, Vec::new()),
            StageType::ThrowError => {
                let error = element
                    .property("error")
                    .filter(|v| !v.is_null())
                    .cloned()
                    .unwrap_or_else(|| Value::from("error"));
                throw_error(id, error)
            }
            other => {
                return Err(GraphError::UnsupportedStage {
                    element_id: element.id.clone(),
                    stage_type: other.to_string(),
                })
            }
        };
        Ok(StageSegment::Source(generator))
    }
}

fn of_values(element: &Element) -> Result<Vec<Value>, GraphError> {
    match element.property("values") {
        Some(Value::Array(items)) => Ok(items.clone()),
        None | Some(Value::Null) => Err(GraphError::invalid_property(&element.id, "values", "missing")),
        Some(single) => Ok(vec![single.clone()]),
    }
}

fn from_values(element: &Element) -> Result<Vec<Value>, GraphError> {
    match element.property("values") {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::String(text)) => Ok(text.chars().map(|c| Value::from(c.to_string())).collect()),
        _ => Err(GraphError::invalid_property(
            &element.id,
            "values",
            "expected an array or a string",
        )),
    }
}

fn period(element: &Element, key: &str) -> Result<Duration, GraphError> {
    match required_u64(element, key)? {
        0 => Err(GraphError::invalid_property(&element.id, key, "must be positive")),
        ms => Ok(Duration::from_millis(ms)),
    }
}

/// Emit fresh values for `values` on every subscription, then complete.
fn emit_all(id: ElementId, values: Vec<Value>) -> PipelineGenerator {
    Arc::new(move || {
        let items: Vec<FlowValue> = values
            .iter()
            .map(|v| FlowValue::next(id.as_str(), v.clone()))
            .collect();
        stream::iter(items).boxed()
    })
}

/// Emit `start..end` lazily, one value per poll.
fn range(id: ElementId, start: i64, end: i64) -> PipelineGenerator {
    Arc::new(move || {
        let id = id.clone();
        stream::iter(start..end)
            .map(move |n| FlowValue::next(id.as_str(), n))
            .boxed()
    })
}

fn throw_error(id: ElementId, error: Value) -> PipelineGenerator {
    Arc::new(move || stream::once(ready(FlowValue::error(id.as_str(), error.clone()))).boxed())
}

/// Emit 0, 1, 2, ...: the first after `first`, the rest every `period`.
/// Without a period only the first is emitted.
fn ticks(id: ElementId, first: Duration, period: Option<Duration>) -> PipelineGenerator {
    Arc::new(move || {
        let id = id.clone();
        stream::unfold(0u64, move |n| {
            let id = id.clone();
            async move {
                let wait = match (n, period) {
                    (0, _) => first,
                    (_, Some(period)) => period,
                    (_, None) => return None,
                };
                tokio::time::sleep(wait).await;
                Some((FlowValue::next(id, n as i64), n + 1))
            }
        })
        .boxed()
    })
}

/// Subscribe the nested pipeline `reference` names.
pub(crate) fn select(pipelines: &[ResolvedPipeline], reference: &PipelineRef) -> Result<FlowStream, String> {
    reference
        .resolve(pipelines)
        .map(ResolvedPipeline::subscribe)
        .ok_or_else(|| format!("unknown pipeline {reference}"))
}

fn fail(stage: &str, message: String) -> FlowStream {
    stream::once(ready(FlowValue::error(stage, message))).boxed()
}
