use crate::decomposer::GraphDecomposer;
use marblecore::{
    ConnectLine, ConnectLineId, Element, ElementId, GraphDocument, GraphError, SimulationSettings,
};
use std::collections::{BTreeSet, HashMap, HashSet};

/// How an edge takes part in the pipeline. Derived from the target's stage
/// type, never stored on the connect line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// The source's normal next stage.
    Direct,
    /// Points at the entry stage of a nested pipeline the source consumes.
    Reference,
}

impl EdgeKind {
    pub fn classify(target: &Element) -> Self {
        if target.stage_type.is_entry() {
            EdgeKind::Reference
        } else {
            EdgeKind::Direct
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub connect_line_id: ConnectLineId,
    pub target: ElementId,
    pub kind: EdgeKind,
}

/// A stage and its outgoing edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub element_id: ElementId,
    pub edges: Vec<GraphEdge>,
}

impl GraphNode {
    pub fn direct_edge(&self) -> Option<&GraphEdge> {
        self.edges.iter().find(|e| e.kind == EdgeKind::Direct)
    }

    pub fn reference_edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter().filter(|e| e.kind == EdgeKind::Reference)
    }
}

/// Ordered chain of stages from one entry stage to its terminal stage, plus
/// the entry stages of every nested pipeline the chain consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphBranch {
    pub entry: ElementId,
    pub nodes: Vec<GraphNode>,
    pub references: BTreeSet<ElementId>,
}

impl GraphBranch {
    /// Last stage of the chain; where the branch's values leave it.
    pub fn terminal(&self) -> &GraphNode {
        // a branch always holds at least its entry node
        &self.nodes[self.nodes.len() - 1]
    }

    /// Each direct edge of the chain with the nodes on both ends.
    pub fn hops(&self) -> impl Iterator<Item = (&GraphNode, &GraphEdge, &GraphNode)> {
        self.nodes.windows(2).filter_map(|pair| {
            pair[0]
                .direct_edge()
                .map(|edge| (&pair[0], edge, &pair[1]))
        })
    }

    pub fn element_ids(&self) -> impl Iterator<Item = &ElementId> {
        self.nodes.iter().map(|n| &n.element_id)
    }
}

/// Id-keyed view over a graph document and its computed branches.
///
/// Lookups return errors instead of options: a missing id always means the
/// graph or the compiler broke an invariant.
#[derive(Debug, Clone)]
pub struct SimulationModel {
    elements: HashMap<ElementId, Element>,
    connect_lines: HashMap<ConnectLineId, ConnectLine>,
    outgoing: HashMap<ElementId, Vec<ConnectLineId>>,
    root: ElementId,
    settings: SimulationSettings,
    branches: HashMap<ElementId, GraphBranch>,
}

impl SimulationModel {
    pub fn from_document(document: &GraphDocument) -> Result<Self, GraphError> {
        let mut model = Self::index(document)?;
        let branches = GraphDecomposer::new(&model).decompose(&model.root)?;
        tracing::debug!(
            root = %model.root,
            branches = branches.len(),
            "decomposed graph '{}'",
            document.name
        );
        model.branches = branches;
        Ok(model)
    }

    fn index(document: &GraphDocument) -> Result<Self, GraphError> {
        let mut elements = HashMap::new();
        for element in &document.elements {
            if elements
                .insert(element.id.clone(), element.clone())
                .is_some()
            {
                return Err(GraphError::DuplicateElement(element.id.clone()));
            }
        }

        let mut connect_lines = HashMap::new();
        let mut outgoing: HashMap<ElementId, Vec<ConnectLineId>> = HashMap::new();
        for line in &document.connect_lines {
            for end in [&line.source.element_id, &line.target.element_id] {
                if !elements.contains_key(end) {
                    return Err(GraphError::DanglingConnectLine {
                        connect_line_id: line.id.clone(),
                        element_id: end.clone(),
                    });
                }
            }
            outgoing
                .entry(line.source.element_id.clone())
                .or_default()
                .push(line.id.clone());
            connect_lines.insert(line.id.clone(), line.clone());
        }
        for ids in outgoing.values_mut() {
            ids.sort_by(|a, b| {
                let (la, lb) = (&connect_lines[a], &connect_lines[b]);
                (la.index, &la.id).cmp(&(lb.index, &lb.id))
            });
        }

        let root = match &document.root {
            Some(root) => root.clone(),
            None => Self::infer_root(document)?,
        };

        Ok(Self {
            elements,
            connect_lines,
            outgoing,
            root,
            settings: document.settings.clone(),
            branches: HashMap::new(),
        })
    }

    /// The single entry stage that nothing references.
    fn infer_root(document: &GraphDocument) -> Result<ElementId, GraphError> {
        let targeted: HashSet<&str> = document
            .connect_lines
            .iter()
            .map(|l| l.target.element_id.as_str())
            .collect();
        let mut candidates: Vec<ElementId> = document
            .elements
            .iter()
            .filter(|e| e.stage_type.is_entry() && !targeted.contains(e.id.as_str()))
            .map(|e| e.id.clone())
            .collect();
        candidates.sort();

        match candidates.len() {
            0 => Err(GraphError::MissingRoot),
            1 => Ok(candidates.remove(0)),
            _ => Err(GraphError::AmbiguousRoot(candidates)),
        }
    }

    pub fn element(&self, id: &str) -> Result<&Element, GraphError> {
        self.elements
            .get(id)
            .ok_or_else(|| GraphError::ElementNotFound(id.to_string()))
    }

    pub fn connect_line(&self, id: &str) -> Result<&ConnectLine, GraphError> {
        self.connect_lines
            .get(id)
            .ok_or_else(|| GraphError::ConnectLineNotFound(id.to_string()))
    }

    pub fn branch(&self, entry: &str) -> Result<&GraphBranch, GraphError> {
        self.branches
            .get(entry)
            .ok_or_else(|| GraphError::BranchNotFound(entry.to_string()))
    }

    pub fn branches(&self) -> &HashMap<ElementId, GraphBranch> {
        &self.branches
    }

    /// Outgoing connect lines of a stage, ordered by index then id.
    pub fn outgoing(&self, id: &str) -> &[ConnectLineId] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn root(&self) -> &ElementId {
        &self.root
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marblecore::StageType;

    fn chain() -> GraphDocument {
        let mut doc = GraphDocument::new("chain");
        doc.add_element(Element::new("src", StageType::Of).with_property("values", vec![1]));
        doc.add_element(Element::new("double", StageType::Map));
        doc.add_element(Element::new("sink", StageType::Subscriber));
        doc.connect("l1", "src", "double");
        doc.connect("l2", "double", "sink");
        doc
    }

    #[test]
    fn infers_single_unreferenced_entry_as_root() {
        let model = SimulationModel::from_document(&chain()).unwrap();
        assert_eq!(model.root(), "src");
    }

    #[test]
    fn ambiguous_root_lists_candidates() {
        let mut doc = chain();
        doc.add_element(Element::new("other", StageType::Empty));

        let err = SimulationModel::from_document(&doc).unwrap_err();
        assert_eq!(
            err,
            GraphError::AmbiguousRoot(vec!["other".to_string(), "src".to_string()])
        );
    }

    #[test]
    fn lookups_fail_loudly() {
        let model = SimulationModel::from_document(&chain()).unwrap();

        assert_eq!(
            model.element("nope").unwrap_err(),
            GraphError::ElementNotFound("nope".to_string())
        );
        assert!(matches!(
            model.connect_line("nope"),
            Err(GraphError::ConnectLineNotFound(_))
        ));
        assert!(matches!(model.branch("double"), Err(GraphError::BranchNotFound(_))));
    }

    #[test]
    fn dangling_connect_line_is_rejected() {
        let mut doc = chain();
        doc.connect("l3", "double", "ghost");

        let err = SimulationModel::from_document(&doc).unwrap_err();
        assert_eq!(err.element_id(), Some("ghost"));
    }

    #[test]
    fn duplicate_element_is_rejected() {
        let mut doc = chain();
        doc.add_element(Element::new("double", StageType::Filter));

        assert_eq!(
            SimulationModel::from_document(&doc).unwrap_err(),
            GraphError::DuplicateElement("double".to_string())
        );
    }

    #[test]
    fn edge_kind_follows_target_stage_type() {
        assert_eq!(
            EdgeKind::classify(&Element::new("a", StageType::Of)),
            EdgeKind::Reference
        );
        assert_eq!(
            EdgeKind::classify(&Element::new("a", StageType::Zip)),
            EdgeKind::Reference
        );
        assert_eq!(
            EdgeKind::classify(&Element::new("a", StageType::Filter)),
            EdgeKind::Direct
        );
    }
}
