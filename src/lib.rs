//! A hierarchical cluster graph: vertices and edges organized into a tree of nested
//! subgraphs, where any vertex may itself stand for an entire nested cluster.
//!
//! The central type is [`Cluster`]: both the root of a tree and every nested cluster in
//! it are the same type, so recursive algorithms over the hierarchy need no special
//! case for "the top". Every vertex and edge also carries a tree-wide stable identity
//! ([`GlobalVertex`], [`GlobalEdge`]) independent of which cluster currently hosts it —
//! see [`id`] — while [`LocalVertex`] / [`LocalEdge`] are cheap positional handles valid
//! only within the one cluster that produced them.
//!
//! Typed, heterogeneous storage for caller-declared attributes and payloads is provided
//! by [`property`]; the slot-arena graph underneath one cluster lives in
//! [`local_graph`].
//!
//! ```
//! use cluster_graph::Cluster;
//!
//! let root = Cluster::root();
//! let (a, _) = root.add_vertex().unwrap();
//! let (b, _) = root.add_vertex().unwrap();
//! root.add_edge_local(a, b).unwrap();
//! assert_eq!(root.vertex_count(), 2);
//! assert_eq!(root.local_edge_count(), 1);
//! ```

#![warn(missing_debug_implementations)]

mod cluster;
mod error;
mod id;
mod local_graph;
mod property;

pub use cluster::{AddEdgeOutcome, Cluster, RemovedItem};
pub use error::{ClusterGraphError, Result};
pub use id::{GlobalEdge, GlobalEdgeId, GlobalVertex, IdAllocator, FIRST_ISSUED_ID};
pub use local_graph::{LocalEdge, LocalVertex};
pub use property::{ChangedKind, IndexKind, ObjectKind, PropertyKind};
