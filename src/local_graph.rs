//! The undirected graph backing one [`Cluster`](crate::cluster::Cluster)'s local vertices
//! and local edges.
//!
//! Storage is a slot arena: one `Vec` of vertex slots and one `Vec` of edge slots, each
//! addressed by a stable `usize` index wrapped in [`LocalVertex`] / [`LocalEdge`].
//! Removing an entity frees its slot onto a free list rather than shifting later
//! entries, so a handle that hasn't itself been removed stays valid across insertions
//! and unrelated removals — the stability guarantee §4.3 of the specification asks for.
//!
//! Parallel local edges between the same pair of vertices are never created: each
//! vertex slot keeps a `Vec` of its incident [`LocalEdge`]s, and looking up the edge
//! between `u` and `v` is a linear scan of the shorter of the two incidence lists,
//! which is the search [`LocalGraph::find_edge`] performs before creating a new one.

use std::collections::HashMap;

use crate::id::{GlobalEdge, GlobalEdgeId, GlobalVertex};
use crate::property::{ObjectBag, PropertyBag};

/// A positional handle into one particular cluster's local graph.
///
/// Not stable across moves to a different cluster and not comparable across clusters —
/// only the [`GlobalVertex`] a vertex carries survives that kind of rearrangement.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalVertex(usize);

impl std::fmt::Debug for LocalVertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalVertex({})", self.0)
    }
}

/// A positional handle into one particular cluster's local graph.
///
/// See [`LocalVertex`] for the stability contract; the same rules apply.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalEdge(usize);

impl std::fmt::Debug for LocalEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalEdge({})", self.0)
    }
}

/// One global edge's contribution to a local edge's aggregate, plus the per-global-edge
/// object bag (§3: "objects are per global edge").
pub(crate) struct GlobalEdgeEntry {
    pub edge: GlobalEdge,
    pub objects: ObjectBag,
}

pub(crate) struct VertexSlot {
    pub global: GlobalVertex,
    pub properties: PropertyBag,
    pub objects: ObjectBag,
    pub incident: Vec<LocalEdge>,
}

pub(crate) struct EdgeSlot {
    pub nodes: [LocalVertex; 2],
    pub properties: PropertyBag,
    /// Never empty while the slot is occupied — the last removal drops the whole slot.
    pub global_edges: Vec<GlobalEdgeEntry>,
}

impl EdgeSlot {
    /// The endpoint of this edge that isn't `from`.
    ///
    /// **Panics** if `from` is neither endpoint — an internal consistency bug.
    pub fn other(&self, from: LocalVertex) -> LocalVertex {
        if self.nodes[0] == from {
            self.nodes[1]
        } else if self.nodes[1] == from {
            self.nodes[0]
        } else {
            panic!("EdgeSlot::other: {from:?} is not an endpoint of this edge");
        }
    }
}

/// Undirected graph of local vertices and local edges, with list-backed storage so
/// handles survive unrelated insertions and removals.
#[derive(Default)]
pub(crate) struct LocalGraph {
    vertices: Vec<Option<VertexSlot>>,
    edges: Vec<Option<EdgeSlot>>,
    free_vertices: Vec<usize>,
    free_edges: Vec<usize>,
    vertex_index: HashMap<GlobalVertex, LocalVertex>,
    edge_index: HashMap<GlobalEdgeId, LocalEdge>,
}

impl LocalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(vertices: usize, edges: usize) -> Self {
        LocalGraph {
            vertices: Vec::with_capacity(vertices),
            edges: Vec::with_capacity(edges),
            free_vertices: Vec::new(),
            free_edges: Vec::new(),
            vertex_index: HashMap::with_capacity(vertices),
            edge_index: HashMap::with_capacity(edges),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_index.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_index.len()
    }

    pub fn local_edge_count(&self) -> usize {
        self.edges.iter().filter(|slot| slot.is_some()).count()
    }

    // -- vertices ---------------------------------------------------------

    pub fn insert_vertex(&mut self, global: GlobalVertex) -> LocalVertex {
        self.insert_vertex_with(global, PropertyBag::new(), ObjectBag::new())
    }

    /// Insert a vertex slot built from an already-existing record — used when
    /// transplanting a vertex's properties/objects across a cluster boundary
    /// ([`crate::cluster::Cluster::move_to_subcluster`],
    /// [`crate::cluster::Cluster::move_to_parent`]) or reproducing one during a deep
    /// copy, where the global id and payloads must survive unchanged.
    pub fn insert_vertex_with(
        &mut self,
        global: GlobalVertex,
        properties: PropertyBag,
        objects: ObjectBag,
    ) -> LocalVertex {
        let slot = VertexSlot {
            global,
            properties,
            objects,
            incident: Vec::new(),
        };
        let lv = if let Some(idx) = self.free_vertices.pop() {
            self.vertices[idx] = Some(slot);
            LocalVertex(idx)
        } else {
            self.vertices.push(Some(slot));
            LocalVertex(self.vertices.len() - 1)
        };
        self.vertex_index.insert(global, lv);
        lv
    }

    pub fn vertex(&self, v: LocalVertex) -> Option<&VertexSlot> {
        self.vertices.get(v.0).and_then(|s| s.as_ref())
    }

    pub fn vertex_mut(&mut self, v: LocalVertex) -> Option<&mut VertexSlot> {
        self.vertices.get_mut(v.0).and_then(|s| s.as_mut())
    }

    pub fn local_vertex_for_global(&self, g: GlobalVertex) -> Option<LocalVertex> {
        self.vertex_index.get(&g).copied()
    }

    /// Remove a vertex slot outright. Caller must have already removed every incident
    /// local edge (and thus cleared `incident`); this does not touch adjacency.
    pub fn remove_vertex(&mut self, v: LocalVertex) -> Option<VertexSlot> {
        let slot = self.vertices.get_mut(v.0)?.take()?;
        self.vertex_index.remove(&slot.global);
        self.free_vertices.push(v.0);
        Some(slot)
    }

    pub fn vertices(&self) -> impl Iterator<Item = LocalVertex> + '_ {
        self.vertices
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| LocalVertex(i)))
    }

    // -- edges --------------------------------------------------------------

    /// Find an existing local edge between `u` and `v`, scanning the shorter incidence
    /// list. `O(min(deg(u), deg(v)))`.
    pub fn find_edge(&self, u: LocalVertex, v: LocalVertex) -> Option<LocalEdge> {
        let scan = match (self.vertex(u), self.vertex(v)) {
            (Some(us), Some(vs)) if us.incident.len() <= vs.incident.len() => &us.incident,
            (Some(_), Some(vs)) => &vs.incident,
            _ => return None,
        };
        scan.iter()
            .copied()
            .find(|&le| self.edge(le).map(|e| e.nodes.contains(&u) && e.nodes.contains(&v)).unwrap_or(false))
    }

    /// Create a fresh, empty-of-global-edges local edge between `u` and `v`. Caller is
    /// responsible for ensuring no edge already exists between them (see
    /// [`find_edge`](Self::find_edge)) and for seeding `global_edges` immediately after.
    pub fn insert_edge(&mut self, u: LocalVertex, v: LocalVertex) -> LocalEdge {
        let slot = EdgeSlot {
            nodes: [u, v],
            properties: PropertyBag::new(),
            global_edges: Vec::new(),
        };
        let le = if let Some(idx) = self.free_edges.pop() {
            self.edges[idx] = Some(slot);
            LocalEdge(idx)
        } else {
            self.edges.push(Some(slot));
            LocalEdge(self.edges.len() - 1)
        };
        if let Some(us) = self.vertex_mut(u) {
            us.incident.push(le);
        }
        if v != u {
            if let Some(vs) = self.vertex_mut(v) {
                vs.incident.push(le);
            }
        }
        le
    }

    /// Find the local edge between `u` and `v`, creating an empty one if absent.
    pub fn find_or_insert_edge(&mut self, u: LocalVertex, v: LocalVertex) -> LocalEdge {
        self.find_edge(u, v).unwrap_or_else(|| self.insert_edge(u, v))
    }

    /// Append a batch of global-edge entries to `le`'s aggregate and index each one, in
    /// a single borrow — used by the mutation engine when redistributing entries across
    /// a cluster boundary, where doing this in two separate steps would otherwise force
    /// two `RefCell` borrows in the caller.
    pub fn append_entries(&mut self, le: LocalEdge, entries: Vec<GlobalEdgeEntry>) {
        let ids: Vec<GlobalEdgeId> = entries.iter().map(|entry| entry.edge.id).collect();
        if let Some(slot) = self.edge_mut(le) {
            slot.global_edges.extend(entries);
        }
        for id in ids {
            self.edge_index.insert(id, le);
        }
    }

    pub fn edge(&self, e: LocalEdge) -> Option<&EdgeSlot> {
        self.edges.get(e.0).and_then(|s| s.as_ref())
    }

    pub fn edge_mut(&mut self, e: LocalEdge) -> Option<&mut EdgeSlot> {
        self.edges.get_mut(e.0).and_then(|s| s.as_mut())
    }

    pub fn local_edge_for_global(&self, ge: GlobalEdgeId) -> Option<LocalEdge> {
        self.edge_index.get(&ge).copied()
    }

    /// Register that `le` now carries `ge` (used when appending to an aggregate).
    pub fn index_global_edge(&mut self, ge: GlobalEdgeId, le: LocalEdge) {
        self.edge_index.insert(ge, le);
    }

    pub fn unindex_global_edge(&mut self, ge: GlobalEdgeId) {
        self.edge_index.remove(&ge);
    }

    /// Remove the local edge slot outright and unthread it from both endpoints'
    /// incidence lists. Does **not** unindex its global edges — caller does that per
    /// entry as part of removing them.
    pub fn remove_edge(&mut self, e: LocalEdge) -> Option<EdgeSlot> {
        let slot = self.edges.get_mut(e.0)?.take()?;
        for &node in &slot.nodes {
            if let Some(vs) = self.vertices.get_mut(node.0).and_then(|s| s.as_mut()) {
                vs.incident.retain(|&incident| incident != e);
            }
        }
        self.free_edges.push(e.0);
        Some(slot)
    }

    pub fn edges(&self) -> impl Iterator<Item = LocalEdge> + '_ {
        self.edges
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| LocalEdge(i)))
    }

    pub fn incident_edges(&self, v: LocalVertex) -> &[LocalEdge] {
        self.vertex(v).map(|s| s.incident.as_slice()).unwrap_or(&[])
    }
}
