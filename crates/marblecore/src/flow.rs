//! Identity-carrying values and the stream types they travel on.

use crate::graph::ElementId;
use crate::Value;
use futures::stream::{unfold, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub type ValueId = Uuid;

/// Whether a flow value is a regular emission or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowKind {
    Next,
    Error,
}

/// A value or error token flowing through a compiled pipeline.
///
/// The `id` is generated once where the value originates and is preserved by
/// every stage that forwards or transforms it, which is what lets the flow
/// manager reconstruct the edges a value travelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowValue {
    pub id: ValueId,
    pub value: Value,
    pub hash: String,
    pub element_id: ElementId,
    pub kind: FlowKind,
}

impl FlowValue {
    /// A new value originating at `element_id`.
    pub fn next(element_id: impl Into<ElementId>, value: impl Into<Value>) -> Self {
        Self::with_kind(Uuid::new_v4(), element_id.into(), value.into(), FlowKind::Next)
    }

    /// A new error originating at `element_id`.
    pub fn error(element_id: impl Into<ElementId>, error: impl Into<Value>) -> Self {
        Self::with_kind(Uuid::new_v4(), element_id.into(), error.into(), FlowKind::Error)
    }

    /// Same identity and origin, new payload.
    pub fn derive(&self, value: impl Into<Value>) -> Self {
        Self::with_kind(self.id, self.element_id.clone(), value.into(), self.kind)
    }

    /// Turn this value into an error raised by `element_id`, keeping its identity.
    pub fn fail(&self, element_id: impl Into<ElementId>, error: impl Into<Value>) -> Self {
        Self::with_kind(self.id, element_id.into(), error.into(), FlowKind::Error)
    }

    pub fn is_error(&self) -> bool {
        self.kind == FlowKind::Error
    }

    fn with_kind(id: ValueId, element_id: ElementId, value: Value, kind: FlowKind) -> Self {
        let hash = value.fingerprint();
        Self {
            id,
            value,
            hash,
            element_id,
            kind,
        }
    }
}

/// A running stream segment. An `Error` item is always the last item.
pub type FlowStream = BoxStream<'static, FlowValue>;

/// Produces a fresh, not yet polled, stream every time it is called.
pub type PipelineGenerator = Arc<dyn Fn() -> FlowStream + Send + Sync>;

/// End `stream` right after the first error it yields. The upstream is
/// dropped as soon as the error is handed out and never polled again.
pub fn until_error(stream: FlowStream) -> FlowStream {
    unfold(Some(stream), |upstream| async move {
        let mut upstream = upstream?;
        let item = upstream.next().await?;
        let rest = (!item.is_error()).then_some(upstream);
        Some((item, rest))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::stream;

    #[test]
    fn derive_keeps_identity_and_rehashes() {
        let original = FlowValue::next("source", 1);
        let derived = original.derive(2);

        assert_eq!(original.id, derived.id);
        assert_eq!(derived.element_id, "source");
        assert_ne!(original.hash, derived.hash);
        assert_eq!(derived.hash, Value::from(2).fingerprint());
    }

    #[test]
    fn fail_keeps_identity_and_moves_origin() {
        let original = FlowValue::next("source", 3);
        let failed = original.fail("filter", "boom");

        assert_eq!(failed.id, original.id);
        assert_eq!(failed.element_id, "filter");
        assert!(failed.is_error());
    }

    #[test]
    fn until_error_stops_after_first_error() {
        let items = vec![
            FlowValue::next("a", 1),
            FlowValue::error("a", "boom"),
            FlowValue::next("a", 2),
        ];
        let collected: Vec<_> = block_on(until_error(stream::iter(items).boxed()).collect());

        assert_eq!(collected.len(), 2);
        assert!(collected[1].is_error());
    }

    #[test]
    fn until_error_does_not_wait_for_upstream() {
        let items = stream::iter(vec![FlowValue::error("a", "boom")]).chain(stream::pending());
        let collected: Vec<_> = block_on(until_error(items.boxed()).collect());

        assert_eq!(collected.len(), 1);
    }
}
