//! Arena of physical operators addressed by index.
//!
//! Operators never point at each other. Each node lists the indices of its
//! successors (its children in the data flow) and predecessor lookups scan
//! the arena, so rewriting a plan cannot leave dangling references.

use smallvec::SmallVec;

use super::EngineError;
use crate::ids::{OperatorId, OriginId, PipelineId};

/// Position of an operator in an [`ExecutablePlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperatorIndex(pub usize);

/// Successor list of a node.
pub type Successors = SmallVec<[OperatorIndex; 2]>;

/// Closed set of operator kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorNode {
    /// Produces buffers from a [`DataSource`](crate::source::DataSource).
    Source {
        /// Operator id of the source.
        id: OperatorId,
        /// Origin stamped on every buffer the source produces.
        origin: OriginId,
        /// Consumers of the source.
        successors: Successors,
    },
    /// Stateless executable pipeline stage.
    Pipeline {
        /// Pipeline id.
        id: PipelineId,
        /// Consumers of the stage output.
        successors: Successors,
    },
    /// Stateful windowed stage backed by a slice store.
    Window {
        /// Operator id of the window handler.
        id: OperatorId,
        /// Consumers of the window output.
        successors: Successors,
    },
    /// Consumes buffers through a [`DataSink`](crate::source::DataSink).
    Sink {
        /// Operator id of the sink.
        id: OperatorId,
    },
}

impl OperatorNode {
    /// Successors of this node; sinks have none.
    #[must_use]
    pub fn successors(&self) -> &[OperatorIndex] {
        match self {
            Self::Source { successors, .. }
            | Self::Pipeline { successors, .. }
            | Self::Window { successors, .. } => successors,
            Self::Sink { .. } => &[],
        }
    }

    fn successors_mut(&mut self) -> Option<&mut Successors> {
        match self {
            Self::Source { successors, .. }
            | Self::Pipeline { successors, .. }
            | Self::Window { successors, .. } => Some(successors),
            Self::Sink { .. } => None,
        }
    }

    /// True for nodes executed through a pipeline stage.
    #[must_use]
    pub fn is_stage(&self) -> bool {
        matches!(self, Self::Pipeline { .. } | Self::Window { .. })
    }

    fn label(&self) -> String {
        match self {
            Self::Source { id, .. } => format!("source {id}"),
            Self::Pipeline { id, .. } => format!("pipeline {id}"),
            Self::Window { id, .. } => format!("window {id}"),
            Self::Sink { id } => format!("sink {id}"),
        }
    }
}

/// Physical plan of one query.
///
/// # Example
///
/// ```rust
/// use nes_core::engine::ExecutablePlan;
/// use nes_core::ids::{OperatorId, OriginId, PipelineId};
///
/// let mut plan = ExecutablePlan::new();
/// let source = plan.add_source(OperatorId(1), OriginId(1));
/// let map = plan.add_pipeline(PipelineId(2));
/// let sink = plan.add_sink(OperatorId(3));
/// plan.connect(source, map).unwrap();
/// plan.connect(map, sink).unwrap();
/// plan.validate().unwrap();
/// assert_eq!(plan.predecessors_of(sink), vec![map]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutablePlan {
    nodes: Vec<OperatorNode>,
}

impl ExecutablePlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: OperatorNode) -> OperatorIndex {
        self.nodes.push(node);
        OperatorIndex(self.nodes.len() - 1)
    }

    /// Adds a source node.
    pub fn add_source(&mut self, id: OperatorId, origin: OriginId) -> OperatorIndex {
        self.push(OperatorNode::Source {
            id,
            origin,
            successors: Successors::new(),
        })
    }

    /// Adds a pipeline node.
    pub fn add_pipeline(&mut self, id: PipelineId) -> OperatorIndex {
        self.push(OperatorNode::Pipeline {
            id,
            successors: Successors::new(),
        })
    }

    /// Adds a window node.
    pub fn add_window(&mut self, id: OperatorId) -> OperatorIndex {
        self.push(OperatorNode::Window {
            id,
            successors: Successors::new(),
        })
    }

    /// Adds a sink node.
    pub fn add_sink(&mut self, id: OperatorId) -> OperatorIndex {
        self.push(OperatorNode::Sink { id })
    }

    /// Routes the output of `from` into `to`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPlan`] for unknown indices, for a sink
    /// as producer, or for a source as consumer.
    pub fn connect(&mut self, from: OperatorIndex, to: OperatorIndex) -> Result<(), EngineError> {
        match self.nodes.get(to.0) {
            None => return Err(EngineError::InvalidPlan(format!("unknown operator {}", to.0))),
            Some(OperatorNode::Source { .. }) => {
                return Err(EngineError::InvalidPlan("a source cannot consume data".into()));
            }
            Some(_) => {}
        }
        let node = self
            .nodes
            .get_mut(from.0)
            .ok_or_else(|| EngineError::InvalidPlan(format!("unknown operator {}", from.0)))?;
        let successors = node
            .successors_mut()
            .ok_or_else(|| EngineError::InvalidPlan("a sink cannot produce data".into()))?;
        if !successors.contains(&to) {
            successors.push(to);
        }
        Ok(())
    }

    /// Node at `index`.
    #[must_use]
    pub fn node(&self, index: OperatorIndex) -> Option<&OperatorNode> {
        self.nodes.get(index.0)
    }

    /// All nodes with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (OperatorIndex, &OperatorNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (OperatorIndex(i), n))
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the plan has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes whose successor list contains `index`.
    #[must_use]
    pub fn predecessors_of(&self, index: OperatorIndex) -> Vec<OperatorIndex> {
        self.iter()
            .filter(|(_, n)| n.successors().contains(&index))
            .map(|(i, _)| i)
            .collect()
    }

    /// Index of the source node with operator id `id`.
    #[must_use]
    pub fn source_index(&self, id: OperatorId) -> Option<OperatorIndex> {
        self.iter()
            .find(|(_, n)| matches!(n, OperatorNode::Source { id: s, .. } if *s == id))
            .map(|(i, _)| i)
    }

    /// Operator ids of all sources.
    #[must_use]
    pub fn source_ids(&self) -> Vec<OperatorId> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                OperatorNode::Source { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Operator ids of all window nodes.
    #[must_use]
    pub fn window_ids(&self) -> Vec<OperatorId> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                OperatorNode::Window { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Operator ids of all sinks.
    #[must_use]
    pub fn sink_ids(&self) -> Vec<OperatorId> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                OperatorNode::Sink { id } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Checks that every edge points into the arena and that the plan is a
    /// DAG with at least one source and one sink.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPlan`] describing the first problem.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.source_ids().is_empty() {
            return Err(EngineError::InvalidPlan("plan has no source".into()));
        }
        if self.sink_ids().is_empty() {
            return Err(EngineError::InvalidPlan("plan has no sink".into()));
        }
        for (index, node) in self.iter() {
            if let Some(bad) = node.successors().iter().find(|s| s.0 >= self.nodes.len()) {
                return Err(EngineError::InvalidPlan(format!(
                    "{} at {} points to unknown operator {}",
                    node.label(),
                    index.0,
                    bad.0
                )));
            }
        }

        // Kahn's algorithm; anything left over sits on a cycle.
        let mut in_degree = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            for s in node.successors() {
                in_degree[s.0] += 1;
            }
        }
        let mut ready: Vec<usize> = (0..self.nodes.len()).filter(|i| in_degree[*i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = ready.pop() {
            visited += 1;
            for s in self.nodes[i].successors() {
                in_degree[s.0] -= 1;
                if in_degree[s.0] == 0 {
                    ready.push(s.0);
                }
            }
        }
        if visited != self.nodes.len() {
            return Err(EngineError::InvalidPlan("plan contains a cycle".into()));
        }

        for (index, node) in self.iter() {
            if !matches!(node, OperatorNode::Source { .. }) && self.predecessors_of(index).is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "{} at {} has no input",
                    node.label(),
                    index.0
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_plan() -> (ExecutablePlan, OperatorIndex, OperatorIndex, OperatorIndex) {
        let mut plan = ExecutablePlan::new();
        let source = plan.add_source(OperatorId(1), OriginId(1));
        let stage = plan.add_pipeline(PipelineId(1));
        let sink = plan.add_sink(OperatorId(2));
        plan.connect(source, stage).unwrap();
        plan.connect(stage, sink).unwrap();
        (plan, source, stage, sink)
    }

    #[test]
    fn test_linear_plan_validates() {
        let (plan, source, stage, sink) = linear_plan();
        plan.validate().unwrap();
        assert_eq!(plan.predecessors_of(stage), vec![source]);
        assert_eq!(plan.source_index(OperatorId(1)), Some(source));
        assert_eq!(plan.sink_ids(), vec![OperatorId(2)]);
        assert!(plan.node(sink).unwrap().successors().is_empty());
    }

    #[test]
    fn test_connect_rejects_bad_edges() {
        let (mut plan, source, _, sink) = linear_plan();
        assert!(plan.connect(sink, source).is_err());
        assert!(plan.connect(source, OperatorIndex(42)).is_err());
        assert!(plan.connect(source, source).is_err());
    }

    #[test]
    fn test_cycle_detected() {
        let mut plan = ExecutablePlan::new();
        let source = plan.add_source(OperatorId(1), OriginId(1));
        let a = plan.add_pipeline(PipelineId(1));
        let b = plan.add_pipeline(PipelineId(2));
        let sink = plan.add_sink(OperatorId(2));
        plan.connect(source, a).unwrap();
        plan.connect(a, b).unwrap();
        plan.connect(b, a).unwrap();
        plan.connect(b, sink).unwrap();
        assert!(matches!(plan.validate(), Err(EngineError::InvalidPlan(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_dangling_node_detected() {
        let (mut plan, ..) = linear_plan();
        plan.add_pipeline(PipelineId(9));
        assert!(plan.validate().is_err());
    }
}
