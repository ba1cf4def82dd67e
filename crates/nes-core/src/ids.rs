//! Strongly typed identifiers shared across the runtime.
//!
//! Every identifier is a transparent `u64` newtype so that a query id can
//! never be passed where an origin id is expected.

use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw numeric value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a deployed query.
    QueryId,
    "query"
);
define_id!(
    /// Identifies an operator within a physical plan.
    OperatorId,
    "op"
);
define_id!(
    /// Logical upstream identity used for watermark tracking and sequencing.
    OriginId,
    "origin"
);
define_id!(
    /// Identifies an executable pipeline stage.
    PipelineId,
    "pipeline"
);
define_id!(
    /// Identifies a worker node in the cluster.
    NodeId,
    "node"
);

/// Index of a worker thread inside the local thread pool.
///
/// Used to pick the per-thread partition of slice state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WorkerThreadId(pub usize);

impl fmt::Display for WorkerThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(QueryId(7).to_string(), "query-7");
        assert_eq!(OriginId::from(3).get(), 3);
        assert_eq!(WorkerThreadId(2).to_string(), "worker-2");
    }
}
