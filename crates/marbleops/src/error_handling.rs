use futures::stream::{self, StreamExt};
use marblecore::{until_error, Element, FlowStream, GraphError, StageCategory, StageType};
use marbleruntime::{NestedPipelines, OperatorFactory, ResolvedPipeline, StageSegment};
use std::sync::Arc;

/// Stages that replace an upstream error with a recovery pipeline.
pub struct ErrorHandlingFactory;

impl OperatorFactory for ErrorHandlingFactory {
    fn category(&self) -> StageCategory {
        StageCategory::ErrorHandling
    }

    fn stage_types(&self) -> &[StageType] {
        &[StageType::CatchError]
    }

    fn create(&self, element: &Element, nested: NestedPipelines) -> Result<StageSegment, GraphError> {
        let recovery = nested.single()?;
        let element_id = element.id.clone();
        Ok(StageSegment::Operator(Arc::new(move |upstream| {
            catch_error(element_id.clone(), upstream, recovery.clone())
        })))
    }
}

enum Phase {
    Upstream(FlowStream),
    Recovery(FlowStream),
}

/// Forward upstream until it fails, then swallow the error and continue with
/// a fresh subscription to `recovery`.
fn catch_error(element_id: String, upstream: FlowStream, recovery: ResolvedPipeline) -> FlowStream {
    let caught = stream::unfold(Phase::Upstream(upstream), move |phase| {
        let recovery = recovery.clone();
        let element_id = element_id.clone();
        async move {
            match phase {
                Phase::Upstream(mut upstream) => {
                    let item = upstream.next().await?;
                    if !item.is_error() {
                        return Some((item, Phase::Upstream(upstream)));
                    }
                    tracing::debug!(stage = %element_id, error = %item.value, "recovering from error");
                    drop(upstream);
                    let mut recovering = recovery.subscribe();
                    let first = recovering.next().await?;
                    Some((first, Phase::Recovery(recovering)))
                }
                Phase::Recovery(mut recovering) => {
                    let item = recovering.next().await?;
                    Some((item, Phase::Recovery(recovering)))
                }
            }
        }
    });
    until_error(caught.boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use marblecore::{ConnectLine, FlowValue, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recovery(values: Vec<FlowValue>, subscriptions: Arc<AtomicUsize>) -> ResolvedPipeline {
        let counter = subscriptions.clone();
        ResolvedPipeline::new(
            ConnectLine::new("rec", "catch", "fallback"),
            Arc::new(move || stream::iter(values.clone()).boxed()),
        )
        .with_on_subscribe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn error_switches_to_recovery() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let upstream = stream::iter(vec![
            FlowValue::next("src", 1),
            FlowValue::error("src", "bad"),
            FlowValue::next("src", 2),
        ])
        .boxed();
        let fallback = recovery(vec![FlowValue::next("fallback", 9)], subscriptions.clone());

        let out: Vec<_> = block_on(catch_error("catch".into(), upstream, fallback).collect());
        let payloads: Vec<_> = out.iter().map(|v| v.value.clone()).collect();
        assert_eq!(payloads, vec![Value::from(1), Value::from(9)]);
        assert!(out.iter().all(|v| !v.is_error()));
        assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recovery_is_not_subscribed_without_error() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let upstream = stream::iter(vec![FlowValue::next("src", 1)]).boxed();
        let fallback = recovery(vec![FlowValue::next("fallback", 9)], subscriptions.clone());

        let out: Vec<_> = block_on(catch_error("catch".into(), upstream, fallback).collect());
        assert_eq!(out.len(), 1);
        assert_eq!(subscriptions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rethrow_from_recovery_ends_the_stream() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let upstream = stream::iter(vec![FlowValue::error("src", "first")]).boxed();
        let fallback = recovery(
            vec![FlowValue::error("fallback", "second"), FlowValue::next("fallback", 3)],
            subscriptions,
        );

        let out: Vec<_> = block_on(catch_error("catch".into(), upstream, fallback).collect());
        assert_eq!(out.len(), 1);
        assert!(out[0].is_error());
        assert_eq!(out[0].value, Value::from("second"));
    }
}
