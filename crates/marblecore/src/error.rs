use crate::graph::{ConnectLineId, ElementId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarbleError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Graph-construction errors.
///
/// All of these abort compilation; none of them is retried. Variants that
/// concern a particular stage expose it through [`GraphError::element_id`] so
/// the editor can highlight the offending element.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Element not found: {0}")]
    ElementNotFound(ElementId),

    #[error("Duplicate element id: {0}")]
    DuplicateElement(ElementId),

    #[error("Connect line not found: {0}")]
    ConnectLineNotFound(ConnectLineId),

    #[error("Connect line {connect_line_id} references unknown element {element_id}")]
    DanglingConnectLine {
        connect_line_id: ConnectLineId,
        element_id: ElementId,
    },

    #[error("Branch not found for entry stage {0}")]
    BranchNotFound(ElementId),

    #[error("Stage {element_id} has no next stage")]
    MissingNextStage { element_id: ElementId },

    #[error("Stage {element_id} has {count} direct next stages")]
    MultipleNextStages { element_id: ElementId, count: usize },

    #[error("Subscriber {element_id} cannot have a next stage")]
    SubscriberHasNextStage { element_id: ElementId },

    #[error("Stage {element_id} cannot start a pipeline")]
    NotAnEntryStage { element_id: ElementId },

    #[error("Stage {element_id} is missing reference pipeline {reference}")]
    MissingReferencePipeline {
        element_id: ElementId,
        reference: String,
    },

    #[error("Stage {element_id} expects {expected} reference pipelines, got {actual}")]
    ReferenceArity {
        element_id: ElementId,
        expected: String,
        actual: usize,
    },

    #[error("Reference {connect_line_id} into stage {element_id} has no name")]
    UnnamedReference {
        element_id: ElementId,
        connect_line_id: ConnectLineId,
    },

    #[error("Cycle through stage {element_id}")]
    DependencyCycle { element_id: ElementId },

    #[error("Stage {element_id} property '{property}': {message}")]
    InvalidProperty {
        element_id: ElementId,
        property: String,
        message: String,
    },

    #[error("Stage {element_id} expression error: {message}")]
    Expression { element_id: ElementId, message: String },

    #[error("No operator factory supports stage {element_id} ({stage_type})")]
    UnsupportedStage {
        element_id: ElementId,
        stage_type: String,
    },

    #[error("No entry stage can be used as simulation root")]
    MissingRoot,

    #[error("Several entry stages could be the simulation root: {0:?}")]
    AmbiguousRoot(Vec<ElementId>),
}

impl GraphError {
    /// The stage this error should be reported against, if any.
    pub fn element_id(&self) -> Option<&str> {
        match self {
            GraphError::ElementNotFound(id)
            | GraphError::DuplicateElement(id)
            | GraphError::BranchNotFound(id) => Some(id),
            GraphError::DanglingConnectLine { element_id, .. }
            | GraphError::MissingNextStage { element_id }
            | GraphError::MultipleNextStages { element_id, .. }
            | GraphError::SubscriberHasNextStage { element_id }
            | GraphError::NotAnEntryStage { element_id }
            | GraphError::MissingReferencePipeline { element_id, .. }
            | GraphError::ReferenceArity { element_id, .. }
            | GraphError::UnnamedReference { element_id, .. }
            | GraphError::DependencyCycle { element_id }
            | GraphError::InvalidProperty { element_id, .. }
            | GraphError::Expression { element_id, .. }
            | GraphError::UnsupportedStage { element_id, .. } => Some(element_id),
            GraphError::ConnectLineNotFound(_)
            | GraphError::MissingRoot
            | GraphError::AmbiguousRoot(_) => None,
        }
    }

    pub fn invalid_property(
        element_id: impl Into<ElementId>,
        property: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        GraphError::InvalidProperty {
            element_id: element_id.into(),
            property: property.into(),
            message: message.into(),
        }
    }
}
