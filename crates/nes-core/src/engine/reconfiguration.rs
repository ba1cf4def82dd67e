//! Reconfiguration messages driving the query termination state machine.

use std::fmt;

use crate::ids::QueryId;

/// How a query (or one of its sources) ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryTerminationType {
    /// In-flight buffers are still delivered before closing.
    #[default]
    Graceful,
    /// In-flight buffers are abandoned and everything closes immediately.
    HardStop,
    /// An error is propagated downstream and everything closes.
    Failure,
}

impl QueryTerminationType {
    /// Wire representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Graceful => 0,
            Self::HardStop => 1,
            Self::Failure => 2,
        }
    }

    /// Parses the wire representation.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Graceful),
            1 => Some(Self::HardStop),
            2 => Some(Self::Failure),
            _ => None,
        }
    }

    /// Reconfiguration that carries this termination downstream.
    #[must_use]
    pub const fn end_of_stream(self) -> ReconfigurationType {
        match self {
            Self::Graceful => ReconfigurationType::SoftEndOfStream,
            Self::HardStop => ReconfigurationType::HardEndOfStream,
            Self::Failure => ReconfigurationType::FailEndOfStream,
        }
    }
}

impl fmt::Display for QueryTerminationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::HardStop => write!(f, "hard-stop"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Kind of a reconfiguration message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconfigurationType {
    /// Open resources (channels, files) before the first buffer.
    Initialize,
    /// Abandon in-flight data and close.
    HardEndOfStream,
    /// Flush in-flight data and close.
    SoftEndOfStream,
    /// Propagate a failure and close.
    FailEndOfStream,
    /// Release everything that is left.
    Destroy,
}

impl ReconfigurationType {
    /// Termination carried by an end-of-stream reconfiguration.
    #[must_use]
    pub const fn termination(self) -> Option<QueryTerminationType> {
        match self {
            Self::SoftEndOfStream => Some(QueryTerminationType::Graceful),
            Self::HardEndOfStream => Some(QueryTerminationType::HardStop),
            Self::FailEndOfStream => Some(QueryTerminationType::Failure),
            Self::Initialize | Self::Destroy => None,
        }
    }
}

/// Control message delivered to sources, stages and sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigurationMessage {
    /// Query the message belongs to.
    pub query_id: QueryId,
    /// What to do.
    pub kind: ReconfigurationType,
    /// Free-form payload, e.g. a failure reason.
    pub user_data: Option<String>,
}

impl ReconfigurationMessage {
    /// Creates a message without payload.
    #[must_use]
    pub fn new(query_id: QueryId, kind: ReconfigurationType) -> Self {
        Self {
            query_id,
            kind,
            user_data: None,
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_user_data(mut self, data: impl Into<String>) -> Self {
        self.user_data = Some(data.into());
        self
    }
}
