use crate::model::{EdgeKind, GraphBranch, GraphEdge, GraphNode, SimulationModel};
use marblecore::{ElementId, GraphError};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Splits a graph into branches, one per entry stage reachable from the root.
///
/// Branches are memoized by entry stage id, so a nested pipeline referenced
/// from several places is walked only once.
pub struct GraphDecomposer<'a> {
    model: &'a SimulationModel,
    cache: HashMap<ElementId, GraphBranch>,
}

impl<'a> GraphDecomposer<'a> {
    pub fn new(model: &'a SimulationModel) -> Self {
        Self {
            model,
            cache: HashMap::new(),
        }
    }

    /// Every branch reachable from `entry`, keyed by entry stage id.
    ///
    /// `entry` itself is treated as the main branch and must end at a
    /// subscriber; nested branches end wherever their direct chain stops.
    pub fn decompose(&mut self, entry: &str) -> Result<HashMap<ElementId, GraphBranch>, GraphError> {
        let mut reachable = HashSet::new();
        self.visit(entry, &mut reachable)?;

        let main = self.branch(entry)?;
        let terminal = self.model.element(&main.terminal().element_id)?;
        if !terminal.stage_type.is_terminal() {
            return Err(GraphError::MissingNextStage {
                element_id: terminal.id.clone(),
            });
        }

        reachable
            .into_iter()
            .map(|id| self.branch(&id).map(|b| (id, b.clone())))
            .collect()
    }

    fn branch(&self, entry: &str) -> Result<&GraphBranch, GraphError> {
        self.cache
            .get(entry)
            .ok_or_else(|| GraphError::BranchNotFound(entry.to_string()))
    }

    fn visit(&mut self, entry: &str, reachable: &mut HashSet<ElementId>) -> Result<(), GraphError> {
        if !reachable.insert(entry.to_string()) {
            return Ok(());
        }

        if !self.cache.contains_key(entry) {
            let branch = self.walk(entry)?;
            tracing::debug!(
                entry,
                stages = branch.nodes.len(),
                references = branch.references.len(),
                "walked branch"
            );
            self.cache.insert(entry.to_string(), branch);
        }

        let references: Vec<ElementId> = self.branch(entry)?.references.iter().cloned().collect();
        for reference in references {
            self.visit(&reference, reachable)?;
        }
        Ok(())
    }

    /// Follow direct edges from `entry` until a subscriber or a stage with
    /// no direct successor.
    fn walk(&self, entry: &str) -> Result<GraphBranch, GraphError> {
        let first = self.model.element(entry)?;
        if !first.stage_type.is_entry() {
            return Err(GraphError::NotAnEntryStage {
                element_id: first.id.clone(),
            });
        }

        let mut nodes = Vec::new();
        let mut references = BTreeSet::new();
        let mut on_chain = HashSet::new();
        let mut current = first.id.clone();

        loop {
            if !on_chain.insert(current.clone()) {
                return Err(GraphError::DependencyCycle { element_id: current });
            }
            let element = self.model.element(&current)?;

            let mut edges = Vec::new();
            let mut next = Vec::new();
            for line_id in self.model.outgoing(&current) {
                let line = self.model.connect_line(line_id)?;
                let target = self.model.element(&line.target.element_id)?;
                let kind = EdgeKind::classify(target);
                match kind {
                    EdgeKind::Reference => {
                        references.insert(target.id.clone());
                    }
                    EdgeKind::Direct => next.push(target.id.clone()),
                }
                edges.push(GraphEdge {
                    connect_line_id: line.id.clone(),
                    target: target.id.clone(),
                    kind,
                });
            }
            nodes.push(GraphNode {
                element_id: current.clone(),
                edges,
            });

            if element.stage_type.is_terminal() {
                if !next.is_empty() {
                    return Err(GraphError::SubscriberHasNextStage { element_id: current });
                }
                break;
            }
            match next.len() {
                0 => break,
                1 => current = next.remove(0),
                count => {
                    return Err(GraphError::MultipleNextStages {
                        element_id: current,
                        count,
                    })
                }
            }
        }

        Ok(GraphBranch {
            entry: entry.to_string(),
            nodes,
            references,
        })
    }
}
