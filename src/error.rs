//! Error type shared by every fallible operation in the crate.

use thiserror::Error;

use crate::id::{GlobalEdgeId, GlobalVertex};

/// The error type returned by fallible [`Cluster`](crate::cluster::Cluster) operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ClusterGraphError {
    /// A global vertex id was not found anywhere in the subtree that was searched.
    #[error("global vertex {0:?} not found in this cluster's subtree")]
    VertexNotFound(GlobalVertex),

    /// A global edge id was not found anywhere in the subtree that was searched.
    #[error("global edge {0:?} not found in this cluster's subtree")]
    EdgeNotFound(GlobalEdgeId),

    /// A local vertex handle does not resolve in the cluster it was used against.
    #[error("local vertex handle is not valid in this cluster")]
    LocalVertexNotFound,

    /// A local edge handle does not resolve in the cluster it was used against.
    #[error("local edge handle is not valid in this cluster")]
    LocalEdgeNotFound,

    /// A precondition documented on the operation was violated.
    #[error("precondition violated: {0}")]
    PreconditionViolated(&'static str),

    /// A cluster has no parent, but an operation that requires one (e.g. `moveToParent`
    /// on the root) was invoked.
    #[error("cluster has no parent")]
    NoParent,

    /// The identifier allocator has exhausted its integer space.
    #[error("identifier allocator exhausted")]
    AllocatorExhausted,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClusterGraphError>;
