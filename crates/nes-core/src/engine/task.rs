//! Schedulable units of work.

use std::fmt;
use std::sync::Arc;

use super::plan::OperatorIndex;
use super::query::ExecutableQuery;
use super::reconfiguration::ReconfigurationMessage;
use crate::buffer::TupleBuffer;

/// Payload of a task.
#[derive(Debug)]
pub enum TaskKind {
    /// Execute the target against one buffer.
    Data(TupleBuffer),
    /// Deliver a reconfiguration to the target.
    Reconfiguration(ReconfigurationMessage),
}

/// One buffer (or control message) paired with the operator that consumes it.
///
/// Dropping a task releases its buffer reference.
pub struct Task {
    pub(crate) query: Arc<ExecutableQuery>,
    pub(crate) target: OperatorIndex,
    pub(crate) kind: TaskKind,
    /// Set once a reconfiguration has been counted against its target.
    pub(crate) counted: bool,
}

impl Task {
    pub(crate) fn data(query: Arc<ExecutableQuery>, target: OperatorIndex, buffer: TupleBuffer) -> Self {
        query.note_enqueued(target);
        Self {
            query,
            target,
            kind: TaskKind::Data(buffer),
            counted: false,
        }
    }

    pub(crate) fn reconfiguration(
        query: Arc<ExecutableQuery>,
        target: OperatorIndex,
        message: ReconfigurationMessage,
    ) -> Self {
        Self {
            query,
            target,
            kind: TaskKind::Reconfiguration(message),
            counted: false,
        }
    }

    /// Query this task belongs to.
    #[must_use]
    pub fn query(&self) -> &Arc<ExecutableQuery> {
        &self.query
    }

    /// Operator that consumes this task.
    #[must_use]
    pub fn target(&self) -> OperatorIndex {
        self.target
    }

    /// The payload.
    #[must_use]
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// The input buffer of a data task.
    #[must_use]
    pub fn buffer(&self) -> Option<&TupleBuffer> {
        match &self.kind {
            TaskKind::Data(buffer) => Some(buffer),
            TaskKind::Reconfiguration(_) => None,
        }
    }

    /// True for data tasks.
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self.kind, TaskKind::Data(_))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("query", &self.query.id())
            .field("target", &self.target)
            .field("kind", &self.kind)
            .finish()
    }
}
