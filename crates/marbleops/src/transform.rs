use crate::creation::select;
use crate::expression::{Expression, ExpressionLimits};
use crate::properties::{required_str, required_u64};
use futures::future::ready;
use futures::stream::{self, Stream, StreamExt};
use marblecore::{
    until_error, Element, FlowStream, FlowValue, GraphError, StageCategory, StageType, Value,
};
use marbleruntime::{
    Arity, NestedPipelines, OperatorFactory, OperatorFn, ResolvedPipeline, StageSegment,
};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Upper bound on values a delay stage holds at once.
const DELAY_CAPACITY: usize = 1024;

/// Stages that transform, filter or project the values of one upstream.
pub struct TransformFactory {
    limits: ExpressionLimits,
}

impl TransformFactory {
    pub fn new(limits: ExpressionLimits) -> Self {
        Self { limits }
    }

    fn expression(&self, element: &Element) -> Result<Expression, GraphError> {
        Expression::compile(element, required_str(element, "expression")?, &self.limits)
    }
}

impl OperatorFactory for TransformFactory {
    fn category(&self) -> StageCategory {
        StageCategory::Transform
    }

    fn stage_types(&self) -> &[StageType] {
        &[
            StageType::Map,
            StageType::Filter,
            StageType::Scan,
            StageType::Take,
            StageType::Skip,
            StageType::Delay,
            StageType::MergeMap,
            StageType::ConcatMap,
            StageType::SwitchMap,
        ]
    }

    fn create(&self, element: &Element, nested: NestedPipelines) -> Result<StageSegment, GraphError> {
        let operator = match element.stage_type {
            StageType::MergeMap | StageType::ConcatMap | StageType::SwitchMap => {
                let expression = self.expression(element)?;
                let pipelines = nested.ordered(Arity::AtLeast(1))?;
                project(element.stage_type, expression, pipelines)
            }
            stage_type => {
                nested.none()?;
                match stage_type {
                    StageType::Map => map(self.expression(element)?),
                    StageType::Filter => filter(self.expression(element)?),
                    StageType::Scan => {
                        let seed = element.property("seed").cloned().unwrap_or(Value::Null);
                        scan(self.expression(element)?, seed)
                    }
                    StageType::Take => take(required_u64(element, "count")?),
                    StageType::Skip => skip(required_u64(element, "count")?),
                    StageType::Delay => {
                        delay(Duration::from_millis(required_u64(element, "duration")?))
                    }
                    other => {
                        return Err(GraphError::UnsupportedStage {
                            element_id: element.id.clone(),
                            stage_type: other.to_string(),
                        })
                    }
                }
            }
        };
        Ok(StageSegment::Operator(operator))
    }
}

fn map(expression: Expression) -> OperatorFn {
    Arc::new(move |upstream| {
        let expression = expression.clone();
        let mut index = 0;
        let mapped = upstream.map(move |item| {
            if item.is_error() {
                return item;
            }
            let result = expression.eval_value(&item.value, index);
            index += 1;
            match result {
                Ok(value) => item.derive(value),
                Err(message) => item.fail(expression.element_id(), message),
            }
        });
        until_error(mapped.boxed())
    })
}

fn filter(expression: Expression) -> OperatorFn {
    Arc::new(move |upstream| {
        let expression = expression.clone();
        let mut index = 0;
        let filtered = upstream.filter_map(move |item| {
            let passed = if item.is_error() {
                Some(item)
            } else {
                let result = expression.eval_predicate(&item.value, index);
                index += 1;
                match result {
                    Ok(true) => Some(item),
                    Ok(false) => None,
                    Err(message) => Some(item.fail(expression.element_id(), message)),
                }
            };
            ready(passed)
        });
        until_error(filtered.boxed())
    })
}

fn scan(expression: Expression, seed: Value) -> OperatorFn {
    Arc::new(move |upstream| {
        let expression = expression.clone();
        let mut index = 0;
        let scanned = upstream.scan(seed.clone(), move |acc, item| {
            if item.is_error() {
                return ready(Some(item));
            }
            let result = expression.eval_accumulator(acc, &item.value, index);
            index += 1;
            ready(Some(match result {
                Ok(next) => {
                    *acc = next.clone();
                    item.derive(next)
                }
                Err(message) => item.fail(expression.element_id(), message),
            }))
        });
        until_error(scanned.boxed())
    })
}

/// Forward the first `count` values, then complete without waiting for the
/// upstream's next item.
fn take(count: u64) -> OperatorFn {
    Arc::new(move |upstream| {
        stream::unfold((upstream, 0), move |(mut upstream, taken)| async move {
            if taken >= count {
                return None;
            }
            let item = upstream.next().await?;
            let taken = if item.is_error() { count } else { taken + 1 };
            Some((item, (upstream, taken)))
        })
        .boxed()
    })
}

fn skip(count: u64) -> OperatorFn {
    Arc::new(move |upstream| {
        let mut skipped = 0;
        upstream
            .filter(move |item| {
                let keep = item.is_error() || skipped >= count;
                if !keep {
                    skipped += 1;
                }
                ready(keep)
            })
            .boxed()
    })
}

fn delay(duration: Duration) -> OperatorFn {
    Arc::new(move |upstream| {
        let delayed = upstream
            .map(move |item| async move {
                if !item.is_error() {
                    tokio::time::sleep(duration).await;
                }
                item
            })
            .buffered(DELAY_CAPACITY);
        until_error(delayed.boxed())
    })
}

type Projector = Box<dyn FnMut(FlowValue) -> FlowStream + Send>;

/// Turns each upstream value into the nested pipeline its expression picks.
/// Errors pass through as a single-item stream.
fn projector(expression: Expression, pipelines: Arc<[ResolvedPipeline]>) -> Projector {
    let mut index = 0;
    Box::new(move |item| {
        if item.is_error() {
            return stream::once(ready(item)).boxed();
        }
        let selected = expression
            .eval_projection(Some(&item.value), index)
            .and_then(|reference| select(&pipelines, &reference));
        index += 1;
        selected.unwrap_or_else(|message| {
            stream::once(ready(item.fail(expression.element_id(), message))).boxed()
        })
    })
}

fn project(
    stage_type: StageType,
    expression: Expression,
    pipelines: Vec<ResolvedPipeline>,
) -> OperatorFn {
    let pipelines: Arc<[ResolvedPipeline]> = pipelines.into();
    Arc::new(move |upstream| {
        let project = projector(expression.clone(), pipelines.clone());
        let projected = match stage_type {
            StageType::MergeMap => upstream.map(project).flatten_unordered(None).boxed(),
            StageType::ConcatMap => upstream.map(project).flatten().boxed(),
            _ => SwitchMap::new(upstream, project).boxed(),
        };
        until_error(projected)
    })
}

/// Follows the nested pipeline of the latest upstream value, dropping the
/// previous one.
struct SwitchMap {
    upstream: Option<FlowStream>,
    inner: Option<FlowStream>,
    project: Projector,
}

impl SwitchMap {
    fn new(upstream: FlowStream, project: Projector) -> Self {
        Self {
            upstream: Some(upstream),
            inner: None,
            project,
        }
    }
}

impl Stream for SwitchMap {
    type Item = FlowValue;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FlowValue>> {
        let this = self.get_mut();
        loop {
            // a new inner gets polled before the next upstream item is pulled
            let mut switched = false;
            if let Some(upstream) = this.upstream.as_mut() {
                match upstream.poll_next_unpin(cx) {
                    Poll::Ready(Some(item)) => {
                        this.inner = Some((this.project)(item));
                        switched = true;
                    }
                    Poll::Ready(None) => this.upstream = None,
                    Poll::Pending => {}
                }
            }

            if let Some(inner) = this.inner.as_mut() {
                match inner.poll_next_unpin(cx) {
                    Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                    Poll::Ready(None) => {
                        this.inner = None;
                        continue;
                    }
                    Poll::Pending => {}
                }
            }

            if this.upstream.is_none() && this.inner.is_none() {
                return Poll::Ready(None);
            }
            if !switched {
                return Poll::Pending;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::stream::pending;

    fn values(items: &[i64]) -> FlowStream {
        let items: Vec<_> = items.iter().map(|n| FlowValue::next("src", *n)).collect();
        stream::iter(items).boxed()
    }

    fn payloads(stream: FlowStream) -> Vec<Value> {
        block_on(stream.map(|item| item.value).collect())
    }

    fn compile(stage_type: StageType, source: &str) -> Expression {
        let element = Element::new("stage", stage_type);
        Expression::compile(&element, source, &ExpressionLimits::default()).unwrap()
    }

    #[test]
    fn map_keeps_value_identity() {
        let input: Vec<_> = (1..=2).map(|n| FlowValue::next("src", n)).collect();
        let ids: Vec<_> = input.iter().map(|v| v.id).collect();
        let op = map(compile(StageType::Map, "value * 2"));

        let out: Vec<_> = block_on(op(stream::iter(input).boxed()).collect());
        assert_eq!(out.iter().map(|v| v.id).collect::<Vec<_>>(), ids);
        assert_eq!(out[1].value, Value::from(4));
    }

    #[test]
    fn map_failure_ends_the_stream() {
        let op = map(compile(StageType::Map, r#"if value == 2 { throw "two" } value"#));
        let out: Vec<_> = block_on(op(values(&[1, 2, 3])).collect());

        assert_eq!(out.len(), 2);
        assert!(out[1].is_error());
        assert_eq!(out[1].element_id, "stage");
        assert_eq!(out[1].value, Value::from("two"));
    }

    #[test]
    fn filter_uses_the_predicate_index() {
        let op = filter(compile(StageType::Filter, "index % 2 == 0"));
        assert_eq!(
            payloads(op(values(&[5, 6, 7, 8]))),
            vec![Value::from(5), Value::from(7)]
        );
    }

    #[test]
    fn scan_accumulates_from_seed() {
        let op = scan(compile(StageType::Scan, "acc + value"), Value::from(10));
        assert_eq!(
            payloads(op(values(&[1, 2, 3]))),
            vec![Value::from(11), Value::from(13), Value::from(16)]
        );
    }

    #[test]
    fn take_completes_without_another_upstream_item() {
        let op = take(2);
        let upstream = values(&[1, 2]).chain(pending()).boxed();
        assert_eq!(payloads(op(upstream)), vec![Value::from(1), Value::from(2)]);
    }

    #[test]
    fn take_zero_completes_immediately() {
        let op = take(0);
        assert!(payloads(op(pending().boxed())).is_empty());
    }

    #[test]
    fn skip_counts_values_only() {
        let op = skip(1);
        assert_eq!(payloads(op(values(&[1, 2, 3]))), vec![Value::from(2), Value::from(3)]);

        let error = FlowValue::error("src", "bad");
        let out: Vec<_> = block_on(op(stream::iter(vec![error]).boxed()).collect());
        assert_eq!(out.len(), 1);
        assert!(out[0].is_error());
    }

    #[test]
    fn switch_map_follows_the_latest_pipeline() {
        let (outer_tx, outer_rx) = futures::channel::mpsc::unbounded::<FlowValue>();
        let (inner_tx, inner_rx) = futures::channel::mpsc::unbounded::<FlowValue>();
        let mut inners = vec![
            stream::iter(vec![FlowValue::next("b", "b1")]).boxed(),
            inner_rx.boxed(),
        ];
        let project: Projector = Box::new(move |_| inners.pop().unwrap());
        let mut switched = SwitchMap::new(outer_rx.boxed(), project);

        block_on(async {
            outer_tx.unbounded_send(FlowValue::next("src", 1)).unwrap();
            inner_tx.unbounded_send(FlowValue::next("a", "a1")).unwrap();
            assert_eq!(switched.next().await.unwrap().value, Value::from("a1"));

            outer_tx.unbounded_send(FlowValue::next("src", 2)).unwrap();
            drop(outer_tx);
            inner_tx.unbounded_send(FlowValue::next("a", "a2")).unwrap();
            let rest: Vec<_> = switched.map(|v| v.value).collect().await;
            assert_eq!(rest, vec![Value::from("b1")]);
        });
    }

    #[test]
    fn switch_map_lets_ready_inner_emit_before_switching() {
        let project: Projector = Box::new(|item: FlowValue| {
            stream::iter(vec![FlowValue::next("inner", item.value)]).boxed()
        });
        let switched = SwitchMap::new(values(&[1, 2]), project);

        assert_eq!(payloads(switched.boxed()), vec![Value::from(1), Value::from(2)]);
    }
}
