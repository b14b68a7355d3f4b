//! [`Cluster`]: a local graph that is also, recursively, a vertex of its parent.
//!
//! A `Cluster` is the handle callers hold: cheap to clone (it's `Rc<RefCell<_>>`
//! underneath, matching the single-threaded ownership model of §5 of the
//! specification), compared by identity rather than structural content, and the
//! surface every mutation engine operation in §4.6 hangs off.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::error::{ClusterGraphError, Result};
use crate::id::{GlobalEdge, GlobalEdgeId, GlobalVertex, IdAllocator};
use crate::local_graph::{GlobalEdgeEntry, LocalEdge, LocalGraph, LocalVertex};
use crate::property::{ChangedKind, IndexKind, ObjectBag, ObjectKind, PropertyBag, PropertyKind};

/// The outcome of [`Cluster::add_edge_global`].
///
/// `scope` is the cross-cluster-scope signal from §7: `false` means `local_edge` was
/// created inside a descendant cluster, not the one `add_edge_global` was called on, so
/// the handle cannot be used against `self`.
#[derive(Debug, Clone, Copy)]
pub struct AddEdgeOutcome {
    pub local_edge: LocalEdge,
    pub edge: GlobalEdge,
    pub scope: bool,
}

/// One item removed by [`Cluster::remove_cluster`] / [`Cluster::remove_cluster_at`] /
/// [`Cluster::clear_clusters`], reported to the caller-supplied functor.
///
/// The functor sees a [`RemovedItem::Cluster`] for a subtree's root before any of that
/// subtree's own vertices or edges, per the recommended ordering pinned in
/// `SPEC_FULL.md` §9.
#[derive(Clone)]
pub enum RemovedItem {
    Cluster(Cluster),
    Vertex(GlobalVertex),
    Edge(GlobalEdge),
}

impl std::fmt::Debug for RemovedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovedItem::Cluster(c) => f.debug_tuple("Cluster").field(c).finish(),
            RemovedItem::Vertex(v) => f.debug_tuple("Vertex").field(v).finish(),
            RemovedItem::Edge(e) => f.debug_tuple("Edge").field(e).finish(),
        }
    }
}

struct ParentLink {
    parent: Weak<RefCell<ClusterInner>>,
    vertex_in_parent: LocalVertex,
}

struct ClusterInner {
    graph: LocalGraph,
    children: HashMap<LocalVertex, Cluster>,
    properties: PropertyBag,
    parent: Option<ParentLink>,
    allocator: IdAllocator,
    copy_mode: bool,
}

/// A local graph that is also, recursively, a vertex of its parent graph.
///
/// Cloning a `Cluster` clones the handle (an `Rc`), not the graph — all clones observe
/// and mutate the same underlying cluster. Two `Cluster`s are [`PartialEq`] iff they are
/// the same cluster in memory (`Rc::ptr_eq`), never by structural comparison.
#[derive(Clone)]
pub struct Cluster {
    inner: Rc<RefCell<ClusterInner>>,
}

impl PartialEq for Cluster {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Cluster {}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Cluster")
            .field("vertices", &inner.graph.vertex_count())
            .field("local_edges", &inner.graph.local_edge_count())
            .field("children", &inner.children.len())
            .field("has_parent", &inner.parent.is_some())
            .finish()
    }
}

impl Cluster {
    /// A fresh root cluster, owning a brand-new identifier allocator.
    pub fn root() -> Cluster {
        Self::with_capacity(0, 0)
    }

    /// A fresh root cluster, pre-sizing its local graph's slot arenas.
    pub fn with_capacity(vertices: usize, edges: usize) -> Cluster {
        Cluster {
            inner: Rc::new(RefCell::new(ClusterInner {
                graph: LocalGraph::with_capacity(vertices, edges),
                children: HashMap::new(),
                properties: PropertyBag::new(),
                parent: None,
                allocator: IdAllocator::new(),
                copy_mode: false,
            })),
        }
    }

    /// Whether `a` and `b` are the same cluster in memory.
    pub fn ptr_eq(a: &Cluster, b: &Cluster) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// The identifier allocator shared by this cluster and every cluster in its tree.
    pub fn allocator(&self) -> IdAllocator {
        self.inner.borrow().allocator.clone()
    }

    /// This cluster's parent, and the local vertex in that parent representing this
    /// cluster — `None` at the root.
    pub fn parent(&self) -> Option<(Cluster, LocalVertex)> {
        let inner = self.inner.borrow();
        let link = inner.parent.as_ref()?;
        let parent = link.parent.upgrade()?;
        Some((Cluster { inner: parent }, link.vertex_in_parent))
    }

    fn mark_changed(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.copy_mode {
            inner.properties.set::<ChangedKind>(true);
        }
    }

    /// Whether this cluster has been mutated (outside copy mode) since `changed` was
    /// last reset.
    pub fn changed(&self) -> bool {
        self.inner.borrow_mut().properties.get::<ChangedKind>().clone()
    }

    /// Clear the `changed` flag on this cluster only (not its descendants).
    pub fn reset_changed(&self) {
        self.inner.borrow_mut().properties.set::<ChangedKind>(false);
    }

    fn set_copy_mode_recursive(&self, on: bool) {
        let children: Vec<Cluster> = {
            let mut inner = self.inner.borrow_mut();
            inner.copy_mode = on;
            inner.children.values().cloned().collect()
        };
        for child in children {
            child.set_copy_mode_recursive(on);
        }
    }

    // -- vertex/edge/cluster property & object access ------------------------------

    /// Read a vertex property, default-constructing it on first access.
    pub fn vertex_property<K: PropertyKind>(&self, v: LocalVertex) -> Result<K::Value> {
        let mut inner = self.inner.borrow_mut();
        let slot = inner
            .graph
            .vertex_mut(v)
            .ok_or(ClusterGraphError::LocalVertexNotFound)?;
        Ok(slot.properties.get::<K>().clone())
    }

    /// Overwrite a vertex property.
    pub fn set_vertex_property<K: PropertyKind>(&self, v: LocalVertex, value: K::Value) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .graph
                .vertex_mut(v)
                .ok_or(ClusterGraphError::LocalVertexNotFound)?;
            slot.properties.set::<K>(value);
        }
        self.mark_changed();
        Ok(())
    }

    /// The payload installed for this vertex and kind, if any.
    pub fn vertex_object<K: ObjectKind>(&self, v: LocalVertex) -> Result<Option<Rc<K::Value>>> {
        let inner = self.inner.borrow();
        let slot = inner
            .graph
            .vertex(v)
            .ok_or(ClusterGraphError::LocalVertexNotFound)?;
        Ok(slot.objects.get::<K>())
    }

    /// Install (or replace) the payload for this vertex and kind.
    pub fn set_vertex_object<K: ObjectKind>(&self, v: LocalVertex, value: Rc<K::Value>) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .graph
                .vertex_mut(v)
                .ok_or(ClusterGraphError::LocalVertexNotFound)?;
            slot.objects.set::<K>(value);
        }
        self.mark_changed();
        Ok(())
    }

    /// Read a local edge property, default-constructing it on first access.
    pub fn edge_property<K: PropertyKind>(&self, e: LocalEdge) -> Result<K::Value> {
        let mut inner = self.inner.borrow_mut();
        let slot = inner
            .graph
            .edge_mut(e)
            .ok_or(ClusterGraphError::LocalEdgeNotFound)?;
        Ok(slot.properties.get::<K>().clone())
    }

    /// Overwrite a local edge property.
    pub fn set_edge_property<K: PropertyKind>(&self, e: LocalEdge, value: K::Value) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .graph
                .edge_mut(e)
                .ok_or(ClusterGraphError::LocalEdgeNotFound)?;
            slot.properties.set::<K>(value);
        }
        self.mark_changed();
        Ok(())
    }

    /// The two local vertices `e` connects, in no particular order.
    pub fn edge_endpoints(&self, e: LocalEdge) -> Result<(LocalVertex, LocalVertex)> {
        let inner = self.inner.borrow();
        let slot = inner
            .graph
            .edge(e)
            .ok_or(ClusterGraphError::LocalEdgeNotFound)?;
        Ok((slot.nodes[0], slot.nodes[1]))
    }

    /// The global edges aggregated onto this local edge, in insertion order.
    pub fn global_edges_of(&self, e: LocalEdge) -> Result<Vec<GlobalEdge>> {
        let inner = self.inner.borrow();
        let slot = inner
            .graph
            .edge(e)
            .ok_or(ClusterGraphError::LocalEdgeNotFound)?;
        Ok(slot.global_edges.iter().map(|entry| entry.edge).collect())
    }

    /// The payload installed for the **first** global edge aggregated onto `e`, for the
    /// given kind — the convenience shortcut documented in §4.2. Use
    /// [`global_edge_object`](Self::global_edge_object) to address a specific global
    /// edge instead.
    pub fn edge_object_first<K: ObjectKind>(&self, e: LocalEdge) -> Result<Option<Rc<K::Value>>> {
        let inner = self.inner.borrow();
        let slot = inner
            .graph
            .edge(e)
            .ok_or(ClusterGraphError::LocalEdgeNotFound)?;
        let first = slot
            .global_edges
            .first()
            .expect("local edge invariant: global_edges is never empty");
        Ok(first.objects.get::<K>())
    }

    /// Install (or replace) the payload for the **first** global edge aggregated onto
    /// `e`. See [`edge_object_first`](Self::edge_object_first).
    pub fn set_edge_object_first<K: ObjectKind>(&self, e: LocalEdge, value: Rc<K::Value>) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .graph
                .edge_mut(e)
                .ok_or(ClusterGraphError::LocalEdgeNotFound)?;
            let first = slot
                .global_edges
                .first_mut()
                .expect("local edge invariant: global_edges is never empty");
            first.objects.set::<K>(value);
        }
        self.mark_changed();
        Ok(())
    }

    /// The payload installed for one specific global edge aggregated onto `e`.
    pub fn global_edge_object<K: ObjectKind>(
        &self,
        e: LocalEdge,
        ge: GlobalEdgeId,
    ) -> Result<Option<Rc<K::Value>>> {
        let inner = self.inner.borrow();
        let slot = inner
            .graph
            .edge(e)
            .ok_or(ClusterGraphError::LocalEdgeNotFound)?;
        let entry = slot
            .global_edges
            .iter()
            .find(|entry| entry.edge.id == ge)
            .ok_or(ClusterGraphError::EdgeNotFound(ge))?;
        Ok(entry.objects.get::<K>())
    }

    /// Install (or replace) the payload for one specific global edge aggregated onto
    /// `e`.
    pub fn set_global_edge_object<K: ObjectKind>(
        &self,
        e: LocalEdge,
        ge: GlobalEdgeId,
        value: Rc<K::Value>,
    ) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .graph
                .edge_mut(e)
                .ok_or(ClusterGraphError::LocalEdgeNotFound)?;
            let entry = slot
                .global_edges
                .iter_mut()
                .find(|entry| entry.edge.id == ge)
                .ok_or(ClusterGraphError::EdgeNotFound(ge))?;
            entry.objects.set::<K>(value);
        }
        self.mark_changed();
        Ok(())
    }

    /// Read a cluster-level property, default-constructing it on first access.
    pub fn cluster_property<K: PropertyKind>(&self) -> K::Value {
        self.inner.borrow_mut().properties.get::<K>().clone()
    }

    /// Overwrite a cluster-level property. Does not itself set `changed` — cluster
    /// properties are caller-managed metadata, not structural state.
    pub fn set_cluster_property<K: PropertyKind>(&self, value: K::Value) {
        self.inner.borrow_mut().properties.set::<K>(value);
    }

    // -- resolution -----------------------------------------------------------------

    /// Resolve a global vertex to a local vertex in *this* cluster: itself if hosted
    /// directly here, or the cluster vertex whose subtree (recursively) contains it.
    ///
    /// With `recursive: false`, only this cluster's own vertices are considered.
    pub fn containing_vertex(&self, g: GlobalVertex, recursive: bool) -> Result<LocalVertex> {
        if let Some(lv) = self.inner.borrow().graph.local_vertex_for_global(g) {
            return Ok(lv);
        }
        if !recursive {
            return Err(ClusterGraphError::VertexNotFound(g));
        }
        let children: Vec<(LocalVertex, Cluster)> = self
            .inner
            .borrow()
            .children
            .iter()
            .map(|(&lv, c)| (lv, c.clone()))
            .collect();
        for (lv, child) in children {
            if child.locate_vertex(g).is_ok() {
                return Ok(lv);
            }
        }
        Err(ClusterGraphError::VertexNotFound(g))
    }

    /// Descend into subclusters and return the deepest cluster that actually hosts `g`
    /// as a non-cluster vertex, along with its local handle there.
    pub fn locate_vertex(&self, g: GlobalVertex) -> Result<(Cluster, LocalVertex)> {
        let inner = self.inner.borrow();
        if let Some(lv) = inner.graph.local_vertex_for_global(g) {
            return Ok((self.clone(), lv));
        }
        for child in inner.children.values() {
            if let Ok(found) = child.locate_vertex(g) {
                return Ok(found);
            }
        }
        Err(ClusterGraphError::VertexNotFound(g))
    }

    /// The local edge in *this* cluster whose aggregate contains `ge`. Does not descend
    /// — a global edge wholly internal to a descendant cluster has no representation at
    /// this level at all. Use [`locate_edge`](Self::locate_edge) to search the subtree.
    pub fn containing_edge(&self, ge: GlobalEdgeId) -> Result<LocalEdge> {
        self.inner
            .borrow()
            .graph
            .local_edge_for_global(ge)
            .ok_or(ClusterGraphError::EdgeNotFound(ge))
    }

    /// Descend into subclusters and return the cluster + local edge that actually
    /// aggregates `ge` — this cluster itself if `ge` crosses one of its boundaries, or a
    /// descendant if `ge` is wholly internal to it.
    pub fn locate_edge(&self, ge: GlobalEdgeId) -> Result<(Cluster, LocalEdge)> {
        let inner = self.inner.borrow();
        if let Some(le) = inner.graph.local_edge_for_global(ge) {
            return Ok((self.clone(), le));
        }
        for child in inner.children.values() {
            if let Ok(found) = child.locate_edge(ge) {
                return Ok(found);
            }
        }
        Err(ClusterGraphError::EdgeNotFound(ge))
    }

    // -- vertex/edge counts and iteration ---------------------------------------------

    pub fn vertex_count(&self) -> usize {
        self.inner.borrow().graph.vertex_count()
    }

    pub fn local_edge_count(&self) -> usize {
        self.inner.borrow().graph.local_edge_count()
    }

    pub fn global_edge_count(&self) -> usize {
        self.inner.borrow().graph.edge_count()
    }

    /// Every local vertex currently in this cluster (not recursive).
    pub fn vertices(&self) -> Vec<LocalVertex> {
        self.inner.borrow().graph.vertices().collect()
    }

    /// Every local edge currently in this cluster (not recursive).
    pub fn local_edges(&self) -> Vec<LocalEdge> {
        self.inner.borrow().graph.edges().collect()
    }

    /// Every global vertex hosted directly in this cluster (not recursive).
    pub fn global_vertices(&self) -> Vec<GlobalVertex> {
        let inner = self.inner.borrow();
        inner
            .graph
            .vertices()
            .filter_map(|lv| inner.graph.vertex(lv).map(|s| s.global))
            .collect()
    }

    /// This vertex's global id.
    pub fn global_of(&self, v: LocalVertex) -> Result<GlobalVertex> {
        self.inner
            .borrow()
            .graph
            .vertex(v)
            .map(|s| s.global)
            .ok_or(ClusterGraphError::LocalVertexNotFound)
    }

    /// Whether this local vertex is itself a nested cluster.
    pub fn is_cluster_vertex(&self, v: LocalVertex) -> bool {
        self.inner.borrow().children.contains_key(&v)
    }

    /// The child clusters of this cluster, each paired with the local vertex
    /// representing it.
    pub fn child_clusters(&self) -> Vec<(LocalVertex, Cluster)> {
        self.inner
            .borrow()
            .children
            .iter()
            .map(|(&lv, c)| (lv, c.clone()))
            .collect()
    }

    /// The nested cluster represented by `v`, if `v` is a cluster vertex.
    pub fn child_at(&self, v: LocalVertex) -> Option<Cluster> {
        self.inner.borrow().children.get(&v).cloned()
    }

    /// Apply `f` to every payload of kind `K` attached anywhere in this cluster (on any
    /// vertex or any global edge); if `recursive`, also within every descendant cluster.
    pub fn for_each_object<K: ObjectKind>(&self, recursive: bool, mut f: impl FnMut(Rc<K::Value>)) {
        let inner = self.inner.borrow();
        for lv in inner.graph.vertices() {
            if let Some(slot) = inner.graph.vertex(lv) {
                if let Some(obj) = slot.objects.get::<K>() {
                    f(obj);
                }
            }
        }
        for le in inner.graph.edges() {
            if let Some(slot) = inner.graph.edge(le) {
                for entry in &slot.global_edges {
                    if let Some(obj) = entry.objects.get::<K>() {
                        f(obj);
                    }
                }
            }
        }
        if recursive {
            let children: Vec<Cluster> = inner.children.values().cloned().collect();
            drop(inner);
            for child in children {
                child.for_each_object::<K>(true, &mut f);
            }
        }
    }

    // -- index rebuild ----------------------------------------------------------------

    /// Assign a dense `0..n-1` integer to each vertex and edge in this cluster, written
    /// into the mandatory `index` property.
    pub fn init_index_maps(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            let vertices: Vec<LocalVertex> = inner.graph.vertices().collect();
            for (i, lv) in vertices.into_iter().enumerate() {
                if let Some(slot) = inner.graph.vertex_mut(lv) {
                    slot.properties.set::<IndexKind>(i);
                }
            }
            let edges: Vec<LocalEdge> = inner.graph.edges().collect();
            for (i, le) in edges.into_iter().enumerate() {
                if let Some(slot) = inner.graph.edge_mut(le) {
                    slot.properties.set::<IndexKind>(i);
                }
            }
        }
        trace!("init_index_maps rebuilt dense indices");
        self.mark_changed();
    }

    // -- mutation: vertices -------------------------------------------------------

    /// Allocate a fresh global id and add a vertex for it.
    pub fn add_vertex(&self) -> Result<(LocalVertex, GlobalVertex)> {
        let id = self.allocator().generate()?;
        let gv = GlobalVertex::from_raw(id);
        let lv = self.inner.borrow_mut().graph.insert_vertex(gv);
        self.mark_changed();
        trace!(global = gv.raw(), "add_vertex");
        Ok((lv, gv))
    }

    /// Adopt an existing global id, fast-forwarding the allocator past it.
    ///
    /// Errors if `g` is one of the reserved `0..=9` sentinel values, or if `g` is
    /// already hosted by this cluster — adopting it twice would break the
    /// one-vertex-per-global-id invariant.
    pub fn add_vertex_with_id(&self, g: GlobalVertex) -> Result<(LocalVertex, GlobalVertex)> {
        if g.is_sentinel() {
            return Err(ClusterGraphError::PreconditionViolated(
                "addVertex(global): id is a reserved sentinel value",
            ));
        }
        if self.inner.borrow().graph.local_vertex_for_global(g).is_some() {
            return Err(ClusterGraphError::PreconditionViolated(
                "addVertex(global): id already hosted in this cluster",
            ));
        }
        self.allocator().set_count(g.raw());
        let lv = self.inner.borrow_mut().graph.insert_vertex(g);
        self.mark_changed();
        trace!(global = g.raw(), "add_vertex_with_id");
        Ok((lv, g))
    }

    fn extract_edge(&self, e: LocalEdge) -> Result<crate::local_graph::EdgeSlot> {
        let mut inner = self.inner.borrow_mut();
        let slot = inner
            .graph
            .remove_edge(e)
            .ok_or(ClusterGraphError::LocalEdgeNotFound)?;
        for entry in &slot.global_edges {
            inner.graph.unindex_global_edge(entry.edge.id);
        }
        Ok(slot)
    }

    fn take_edge_globals(&self, e: LocalEdge) -> Result<Vec<GlobalEdge>> {
        Ok(self
            .extract_edge(e)?
            .global_edges
            .into_iter()
            .map(|entry| entry.edge)
            .collect())
    }

    /// Remove a vertex and every local edge incident to it, invoking `f` on every
    /// incident global edge before removal.
    ///
    /// Does not special-case cluster vertices: removing one orphans the nested cluster.
    /// Use [`remove_cluster_at`](Self::remove_cluster_at) for those.
    pub fn remove_vertex_local(&self, v: LocalVertex, mut f: impl FnMut(GlobalEdge)) -> Result<()> {
        {
            let inner = self.inner.borrow();
            inner
                .graph
                .vertex(v)
                .ok_or(ClusterGraphError::LocalVertexNotFound)?;
        }
        let incident: Vec<LocalEdge> = self.inner.borrow().graph.incident_edges(v).to_vec();
        for e in incident {
            for ge in self.take_edge_globals(e)? {
                f(ge);
            }
        }
        self.inner.borrow_mut().graph.remove_vertex(v);
        self.mark_changed();
        trace!("remove_vertex_local");
        Ok(())
    }

    /// Remove the cluster that currently hosts `g`, invoking `f` on every incident
    /// global edge at the host level, and once more at every ancestor level up to and
    /// including this cluster for any aggregated edge that touched `g`.
    pub fn remove_vertex_global(&self, g: GlobalVertex, mut f: impl FnMut(GlobalEdge)) -> Result<()> {
        let (host, local_v) = self.locate_vertex(g)?;
        host.remove_vertex_local(local_v, &mut f)?;

        let mut current = host;
        loop {
            if Cluster::ptr_eq(&current, self) {
                break;
            }
            let (parent, rep) = current
                .parent()
                .ok_or(ClusterGraphError::NoParent)?;
            let incident: Vec<LocalEdge> = parent.inner.borrow().graph.incident_edges(rep).to_vec();
            for le in incident {
                let pulled = {
                    let mut pinner = parent.inner.borrow_mut();
                    let mut pulled = Vec::new();
                    if let Some(slot) = pinner.graph.edge_mut(le) {
                        let mut i = 0;
                        while i < slot.global_edges.len() {
                            if slot.global_edges[i].edge.has_endpoint(g) {
                                pulled.push(slot.global_edges.remove(i));
                            } else {
                                i += 1;
                            }
                        }
                    }
                    for entry in &pulled {
                        pinner.graph.unindex_global_edge(entry.edge.id);
                    }
                    let empty = pinner
                        .graph
                        .edge(le)
                        .map(|s| s.global_edges.is_empty())
                        .unwrap_or(false);
                    if empty {
                        pinner.graph.remove_edge(le);
                    }
                    pulled
                };
                for entry in pulled {
                    f(entry.edge);
                }
            }
            parent.mark_changed();
            current = parent;
        }
        debug!(global = g.raw(), "remove_vertex_global");
        Ok(())
    }

    // -- mutation: edges ------------------------------------------------------------

    fn create_or_append_edge(
        &self,
        u: LocalVertex,
        v: LocalVertex,
        s: GlobalVertex,
        t: GlobalVertex,
    ) -> Result<(LocalEdge, GlobalEdge)> {
        let id = self.allocator().generate()?;
        let ge = GlobalEdge::new(s, t, GlobalEdgeId::from_raw(id));
        let le = {
            let mut inner = self.inner.borrow_mut();
            let le = inner.graph.find_or_insert_edge(u, v);
            inner
                .graph
                .append_entries(le, vec![GlobalEdgeEntry { edge: ge, objects: ObjectBag::new() }]);
            self_check_endpoints(&inner.graph, le);
            le
        };
        self.mark_changed();
        Ok((le, ge))
    }

    /// Add an edge between two local vertices of this cluster.
    ///
    /// Errors if `u == v` or either is a cluster vertex — use
    /// [`add_edge_global`](Self::add_edge_global) to wire a cluster vertex.
    pub fn add_edge_local(&self, u: LocalVertex, v: LocalVertex) -> Result<(LocalEdge, GlobalEdge)> {
        if u == v {
            return Err(ClusterGraphError::PreconditionViolated(
                "addEdge requires two distinct endpoints",
            ));
        }
        let (gu, gv) = {
            let inner = self.inner.borrow();
            if inner.children.contains_key(&u) || inner.children.contains_key(&v) {
                return Err(ClusterGraphError::PreconditionViolated(
                    "addEdge(local, local) cannot target a cluster vertex",
                ));
            }
            let gu = inner
                .graph
                .vertex(u)
                .ok_or(ClusterGraphError::LocalVertexNotFound)?
                .global;
            let gv = inner
                .graph
                .vertex(v)
                .ok_or(ClusterGraphError::LocalVertexNotFound)?
                .global;
            (gu, gv)
        };
        let result = self.create_or_append_edge(u, v, gu, gv);
        if let Ok((_, ge)) = &result {
            trace!(edge = ge.id.raw(), "add_edge_local");
        }
        result
    }

    /// Add an edge between two global vertices somewhere in this cluster's subtree.
    ///
    /// If both resolve to the same local vertex in this cluster, the edge lives
    /// entirely inside the descendant cluster that vertex represents, and the operation
    /// recurses there (`scope` comes back `false`).
    pub fn add_edge_global(&self, s: GlobalVertex, t: GlobalVertex) -> Result<AddEdgeOutcome> {
        let lu = self.containing_vertex(s, true)?;
        let lv = self.containing_vertex(t, true)?;
        if lu == lv {
            let child = self
                .inner
                .borrow()
                .children
                .get(&lu)
                .cloned()
                .ok_or(ClusterGraphError::PreconditionViolated(
                    "addEdge(global, global) requires distinct endpoints",
                ))?;
            let mut outcome = child.add_edge_global(s, t)?;
            outcome.scope = false;
            return Ok(outcome);
        }
        let (local_edge, edge) = self.create_or_append_edge(lu, lv, s, t)?;
        debug!(source = s.raw(), target = t.raw(), "add_edge_global");
        Ok(AddEdgeOutcome { local_edge, edge, scope: true })
    }

    /// Remove a specific global edge. If it was the last entry aggregated onto its
    /// local edge, the local edge is removed too.
    pub fn remove_edge_global(&self, ge: GlobalEdgeId) -> Result<()> {
        let (cluster, le) = self.locate_edge(ge)?;
        {
            let mut inner = cluster.inner.borrow_mut();
            if let Some(slot) = inner.graph.edge_mut(le) {
                if let Some(pos) = slot.global_edges.iter().position(|entry| entry.edge.id == ge) {
                    slot.global_edges.remove(pos);
                }
            }
            inner.graph.unindex_global_edge(ge);
            let empty = inner
                .graph
                .edge(le)
                .map(|s| s.global_edges.is_empty())
                .unwrap_or(false);
            if empty {
                inner.graph.remove_edge(le);
            }
        }
        cluster.mark_changed();
        trace!(edge = ge.raw(), "remove_edge_global");
        Ok(())
    }

    /// Remove a local edge outright, invoking `f` on every global edge it carried.
    pub fn remove_edge_local(&self, e: LocalEdge, mut f: impl FnMut(GlobalEdge)) -> Result<()> {
        for ge in self.take_edge_globals(e)? {
            f(ge);
        }
        self.mark_changed();
        trace!("remove_edge_local");
        Ok(())
    }

    // -- mutation: clusters -----------------------------------------------------------

    fn attach_child_cluster(&self, lv: LocalVertex) -> Cluster {
        let copy_mode = self.inner.borrow().copy_mode;
        let child = Cluster {
            inner: Rc::new(RefCell::new(ClusterInner {
                graph: LocalGraph::new(),
                children: HashMap::new(),
                properties: PropertyBag::new(),
                parent: Some(ParentLink {
                    parent: Rc::downgrade(&self.inner),
                    vertex_in_parent: lv,
                }),
                allocator: self.allocator(),
                copy_mode,
            })),
        };
        self.inner.borrow_mut().children.insert(lv, child.clone());
        child
    }

    /// Allocate a fresh local vertex in this cluster and attach a new, empty cluster to
    /// it.
    pub fn create_cluster(&self) -> Result<(Cluster, LocalVertex)> {
        let id = self.allocator().generate()?;
        let gv = GlobalVertex::from_raw(id);
        let lv = self.inner.borrow_mut().graph.insert_vertex(gv);
        let child = self.attach_child_cluster(lv);
        self.mark_changed();
        debug!(cluster_vertex = gv.raw(), "create_cluster");
        Ok((child, lv))
    }

    fn destroy_cluster_recursive(cluster: &Cluster, f: &mut impl FnMut(RemovedItem)) {
        f(RemovedItem::Cluster(cluster.clone()));

        let (edges, vertices, children): (Vec<LocalEdge>, Vec<LocalVertex>, HashMap<LocalVertex, Cluster>) = {
            let inner = cluster.inner.borrow();
            (
                inner.graph.edges().collect(),
                inner.graph.vertices().collect(),
                inner.children.clone(),
            )
        };

        for le in edges {
            if let Some(slot) = cluster.inner.borrow().graph.edge(le) {
                for entry in &slot.global_edges {
                    f(RemovedItem::Edge(entry.edge));
                }
            }
        }

        for lv in vertices {
            if let Some(nested) = children.get(&lv) {
                Self::destroy_cluster_recursive(nested, f);
            }
            let gv = cluster.inner.borrow().graph.vertex(lv).map(|s| s.global);
            if let Some(gv) = gv {
                f(RemovedItem::Vertex(gv));
            }
        }
    }

    /// Remove the cluster represented by `lv`, invoking `f` on every cluster, global
    /// vertex, and global edge removed recursively — plus once more, per removed global
    /// edge, for the boundary edges this cluster aggregated at `lv`.
    pub fn remove_cluster_at(&self, lv: LocalVertex, mut f: impl FnMut(RemovedItem)) -> Result<()> {
        let child = {
            let inner = self.inner.borrow();
            inner
                .children
                .get(&lv)
                .cloned()
                .ok_or(ClusterGraphError::LocalVertexNotFound)?
        };
        Self::destroy_cluster_recursive(&child, &mut f);

        let incident: Vec<LocalEdge> = self.inner.borrow().graph.incident_edges(lv).to_vec();
        for le in incident {
            for ge in self.take_edge_globals(le)? {
                f(RemovedItem::Edge(ge));
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.children.remove(&lv);
            inner.graph.remove_vertex(lv);
        }
        self.mark_changed();
        debug!("remove_cluster_at");
        Ok(())
    }

    /// Remove a child cluster by reference.
    pub fn remove_cluster(&self, child: &Cluster, f: impl FnMut(RemovedItem)) -> Result<()> {
        let lv = self
            .inner
            .borrow()
            .children
            .iter()
            .find(|(_, c)| Cluster::ptr_eq(c, child))
            .map(|(&lv, _)| lv)
            .ok_or(ClusterGraphError::PreconditionViolated(
                "not a child of this cluster",
            ))?;
        self.remove_cluster_at(lv, f)
    }

    /// Remove every child cluster of this cluster.
    pub fn clear_clusters(&self, mut f: impl FnMut(RemovedItem)) -> Result<()> {
        let handles: Vec<LocalVertex> = self.inner.borrow().children.keys().copied().collect();
        for lv in handles {
            self.remove_cluster_at(lv, &mut f)?;
        }
        Ok(())
    }

    // -- mutation: moves --------------------------------------------------------------

    /// Move vertex `v` out of this cluster and into child cluster `child`.
    ///
    /// Every local edge incident to `v` is rewired: those that ran to the vertex
    /// representing `child` become internal edges of `child`; every other local edge is
    /// redirected so it runs from `child`'s representative vertex to its existing far
    /// endpoint, merging into any aggregate that already exists there.
    pub fn move_to_subcluster(&self, v: LocalVertex, child: &Cluster) -> Result<LocalVertex> {
        let d = self
            .inner
            .borrow()
            .children
            .iter()
            .find(|(_, c)| Cluster::ptr_eq(c, child))
            .map(|(&lv, _)| lv)
            .ok_or(ClusterGraphError::PreconditionViolated(
                "not a child of this cluster",
            ))?;
        {
            let inner = self.inner.borrow();
            if inner.children.contains_key(&v) {
                return Err(ClusterGraphError::PreconditionViolated(
                    "moveToSubcluster cannot relocate a cluster vertex",
                ));
            }
            inner
                .graph
                .vertex(v)
                .ok_or(ClusterGraphError::LocalVertexNotFound)?;
        }

        let v_global = self.inner.borrow().graph.vertex(v).unwrap().global;
        let incident: Vec<LocalEdge> = self.inner.borrow().graph.incident_edges(v).to_vec();

        let mut internal: HashMap<LocalVertex, Vec<GlobalEdgeEntry>> = HashMap::new();

        for e in incident {
            let slot = self.extract_edge(e)?;
            let w = if slot.nodes[0] == v { slot.nodes[1] } else { slot.nodes[0] };
            if w == d {
                for entry in slot.global_edges {
                    let other_global = entry.edge.other(v_global);
                    let target = child.containing_vertex(other_global, true)?;
                    internal.entry(target).or_default().push(entry);
                }
            } else {
                let mut inner = self.inner.borrow_mut();
                let le = inner.graph.find_or_insert_edge(d, w);
                inner.graph.append_entries(le, slot.global_edges);
            }
        }

        let extracted = self
            .inner
            .borrow_mut()
            .graph
            .remove_vertex(v)
            .expect("vertex validated present above");
        let v_prime = child.inner.borrow_mut().graph.insert_vertex_with(
            extracted.global,
            extracted.properties,
            extracted.objects,
        );

        for (target, entries) in internal {
            let mut dinner = child.inner.borrow_mut();
            let le = dinner.graph.find_or_insert_edge(v_prime, target);
            dinner.graph.append_entries(le, entries);
        }

        self.mark_changed();
        child.mark_changed();
        debug!(global = v_global.raw(), "move_to_subcluster");
        Ok(v_prime)
    }

    /// Promote vertex `v` out of this cluster into its parent.
    ///
    /// The exact inverse of [`move_to_subcluster`](Self::move_to_subcluster): every
    /// local edge still internal to this cluster becomes a boundary edge between the
    /// promoted vertex and this cluster's own representative vertex in the parent, and
    /// every parent-side aggregate that touched `v`'s global id is split out into a
    /// direct edge from the promoted vertex to that aggregate's far endpoint.
    pub fn move_to_parent(&self, v: LocalVertex) -> Result<LocalVertex> {
        let (parent, d) = self.parent().ok_or(ClusterGraphError::NoParent)?;
        {
            let inner = self.inner.borrow();
            if inner.children.contains_key(&v) {
                return Err(ClusterGraphError::PreconditionViolated(
                    "moveToParent cannot relocate a cluster vertex",
                ));
            }
            inner
                .graph
                .vertex(v)
                .ok_or(ClusterGraphError::LocalVertexNotFound)?;
        }
        let v_global = self.inner.borrow().graph.vertex(v).unwrap().global;

        let incident: Vec<LocalEdge> = self.inner.borrow().graph.incident_edges(v).to_vec();
        let mut to_parent_d: Vec<GlobalEdgeEntry> = Vec::new();
        for e in incident {
            let slot = self.extract_edge(e)?;
            to_parent_d.extend(slot.global_edges);
        }

        let d_incident: Vec<LocalEdge> = parent.inner.borrow().graph.incident_edges(d).to_vec();
        let mut split: Vec<(LocalVertex, Vec<GlobalEdgeEntry>)> = Vec::new();
        for le in d_incident {
            let mut pinner = parent.inner.borrow_mut();
            let far = match pinner.graph.edge(le) {
                Some(slot) => slot.other(d),
                None => continue,
            };
            let mut pulled = Vec::new();
            if let Some(slot) = pinner.graph.edge_mut(le) {
                let mut i = 0;
                while i < slot.global_edges.len() {
                    if slot.global_edges[i].edge.has_endpoint(v_global) {
                        pulled.push(slot.global_edges.remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
            if pulled.is_empty() {
                continue;
            }
            for entry in &pulled {
                pinner.graph.unindex_global_edge(entry.edge.id);
            }
            let empty = pinner
                .graph
                .edge(le)
                .map(|s| s.global_edges.is_empty())
                .unwrap_or(false);
            if empty {
                pinner.graph.remove_edge(le);
            }
            split.push((far, pulled));
        }

        let extracted = self
            .inner
            .borrow_mut()
            .graph
            .remove_vertex(v)
            .expect("vertex validated present above");
        let v_promoted = parent.inner.borrow_mut().graph.insert_vertex_with(
            extracted.global,
            extracted.properties,
            extracted.objects,
        );

        if !to_parent_d.is_empty() {
            let mut pinner = parent.inner.borrow_mut();
            let le = pinner.graph.find_or_insert_edge(v_promoted, d);
            pinner.graph.append_entries(le, to_parent_d);
        }
        for (far, entries) in split {
            let mut pinner = parent.inner.borrow_mut();
            let le = pinner.graph.find_or_insert_edge(v_promoted, far);
            pinner.graph.append_entries(le, entries);
        }

        self.mark_changed();
        parent.mark_changed();
        debug!(global = v_global.raw(), "move_to_parent");
        Ok(v_promoted)
    }

    // -- copy --------------------------------------------------------------------

    /// Deep-structural copy of this cluster's subtree into `dest`: every global id is
    /// preserved, the cluster hierarchy is reproduced, and every stored payload is
    /// passed through `copy_object` (keyed by the payload's [`TypeId`]) to produce the
    /// copy's payload — return the same `Rc` to share it, or a fresh one to clone it.
    ///
    /// `dest` runs in copy mode for the duration, so none of its clusters' `changed`
    /// flags are spuriously set by the copy itself (any `changed` value the copy ends up
    /// with came from copying the source's own cluster properties).
    pub fn copy_into(&self, dest: &Cluster, copy_object: impl Fn(TypeId, &Rc<dyn Any>) -> Rc<dyn Any>) -> Result<()> {
        dest.inner.borrow_mut().copy_mode = true;
        dest.allocator().set_count(self.allocator().count());
        self.copy_into_impl(dest, &copy_object);
        dest.set_copy_mode_recursive(false);
        debug!("copy_into");
        Ok(())
    }

    fn copy_into_impl(&self, dest: &Cluster, copy_object: &impl Fn(TypeId, &Rc<dyn Any>) -> Rc<dyn Any>) {
        {
            let props = self.inner.borrow().properties.clone();
            dest.inner.borrow_mut().properties = props;
        }

        let vertices: Vec<LocalVertex> = self.inner.borrow().graph.vertices().collect();
        let mut vertex_map: HashMap<LocalVertex, LocalVertex> = HashMap::with_capacity(vertices.len());

        for lv in vertices {
            let (global, props, mapped_objects, nested) = {
                let inner = self.inner.borrow();
                let slot = inner.graph.vertex(lv).expect("snapshot just taken");
                let mut objects = ObjectBag::new();
                for (kind, rc) in slot.objects.iter_raw() {
                    objects.insert_raw(kind, copy_object(kind, rc));
                }
                let nested = inner.children.get(&lv).cloned();
                (slot.global, slot.properties.clone(), objects, nested)
            };
            let dest_lv = dest
                .inner
                .borrow_mut()
                .graph
                .insert_vertex_with(global, props, mapped_objects);
            vertex_map.insert(lv, dest_lv);

            if let Some(nested_src) = nested {
                let nested_dest = dest.attach_child_cluster(dest_lv);
                nested_src.copy_into_impl(&nested_dest, copy_object);
            }
        }

        let edges: Vec<LocalEdge> = self.inner.borrow().graph.edges().collect();
        for le in edges {
            let (nodes, props) = {
                let inner = self.inner.borrow();
                let slot = inner.graph.edge(le).expect("snapshot just taken");
                (slot.nodes, slot.properties.clone())
            };
            let du = vertex_map[&nodes[0]];
            let dv = vertex_map[&nodes[1]];
            let dest_le = dest.inner.borrow_mut().graph.insert_edge(du, dv);
            if let Some(dslot) = dest.inner.borrow_mut().graph.edge_mut(dest_le) {
                dslot.properties = props;
            }

            let entries: Vec<(GlobalEdge, ObjectBag)> = {
                let inner = self.inner.borrow();
                let slot = inner.graph.edge(le).expect("snapshot just taken");
                slot.global_edges
                    .iter()
                    .map(|entry| {
                        let mut objects = ObjectBag::new();
                        for (kind, rc) in entry.objects.iter_raw() {
                            objects.insert_raw(kind, copy_object(kind, rc));
                        }
                        (entry.edge, objects)
                    })
                    .collect()
            };
            let mapped = entries
                .into_iter()
                .map(|(edge, objects)| GlobalEdgeEntry { edge, objects })
                .collect();
            dest.inner.borrow_mut().graph.append_entries(dest_le, mapped);
        }
    }
}

/// Debug assertion (test builds only) that a freshly inserted edge's endpoints are
/// exactly its two distinct local vertices — cheap to check here, where the edge was
/// just created, rather than leaving invariant 3 unverified until the next traversal.
#[cfg(debug_assertions)]
fn self_check_endpoints(graph: &LocalGraph, le: LocalEdge) {
    if let Some(slot) = graph.edge(le) {
        debug_assert_ne!(slot.nodes[0], slot.nodes[1], "local edge must join two distinct vertices");
    }
}

#[cfg(not(debug_assertions))]
fn self_check_endpoints(_graph: &LocalGraph, _le: LocalEdge) {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Weight;
    impl PropertyKind for Weight {
        type Value = f64;
    }

    struct Payload;
    impl ObjectKind for Payload {
        type Value = &'static str;
    }

    #[test]
    fn add_edge_local_rejects_equal_endpoints() {
        let root = Cluster::root();
        let (lv, _) = root.add_vertex().unwrap();
        let err = root.add_edge_local(lv, lv).unwrap_err();
        assert_eq!(err, ClusterGraphError::PreconditionViolated(
            "addEdge requires two distinct endpoints",
        ));
    }

    #[test]
    fn add_edge_local_rejects_cluster_vertex() {
        let root = Cluster::root();
        let (lv, _) = root.add_vertex().unwrap();
        let (_, cluster_lv) = root.create_cluster().unwrap();
        assert!(root.add_edge_local(lv, cluster_lv).is_err());
    }

    #[test]
    fn mutation_sets_changed_but_reads_do_not() {
        let root = Cluster::root();
        assert!(!root.changed());
        let (lv, _) = root.add_vertex().unwrap();
        assert!(root.changed());
        root.reset_changed();
        assert!(!root.changed());

        let _ = root.vertex_property::<Weight>(lv);
        assert!(!root.changed(), "a read-only property access must not set changed");
    }

    #[test]
    fn edge_object_shortcut_addresses_first_global_edge_only() {
        let root = Cluster::root();
        let (a, _) = root.add_vertex().unwrap();
        let (b, _) = root.add_vertex().unwrap();
        let (le, first) = root.add_edge_local(a, b).unwrap();
        let (_, second) = root.add_edge_local(a, b).unwrap();
        assert_eq!(root.global_edges_of(le).unwrap(), vec![first, second]);

        root.set_edge_object_first::<Payload>(le, Rc::new("first")).unwrap();
        assert_eq!(root.edge_object_first::<Payload>(le).unwrap().as_deref(), Some(&"first"));
        assert!(root.global_edge_object::<Payload>(le, second.id).unwrap().is_none());

        root.set_global_edge_object::<Payload>(le, second.id, Rc::new("second")).unwrap();
        assert_eq!(
            root.global_edge_object::<Payload>(le, second.id).unwrap().as_deref(),
            Some(&"second")
        );
        assert_eq!(root.edge_object_first::<Payload>(le).unwrap().as_deref(), Some(&"first"));
    }

    #[test]
    fn copy_into_preserves_global_ids_and_shares_objects_by_default() {
        let src = Cluster::root();
        let (a, ga) = src.add_vertex().unwrap();
        let (b, _) = src.add_vertex().unwrap();
        src.set_vertex_object::<Payload>(a, Rc::new("payload")).unwrap();
        src.add_edge_local(a, b).unwrap();

        let dest = Cluster::root();
        src.copy_into(&dest, |_, rc| Rc::clone(rc)).unwrap();

        assert_eq!(dest.vertex_count(), 2);
        assert_eq!(dest.local_edge_count(), 1);
        let copied_a = dest.containing_vertex(ga, false).unwrap();
        assert_eq!(
            dest.vertex_object::<Payload>(copied_a).unwrap().as_deref(),
            Some(&"payload")
        );
        assert!(!dest.changed(), "copy_into must not leave changed set via copy mode");
    }

    #[test]
    fn add_vertex_with_id_rejects_sentinel_values() {
        let root = Cluster::root();
        for sentinel in 0..crate::id::FIRST_ISSUED_ID {
            assert!(root.add_vertex_with_id(GlobalVertex::from_raw(sentinel)).is_err());
        }
    }

    #[test]
    fn add_vertex_with_id_fast_forwards_allocator() {
        let root = Cluster::root();
        root.add_vertex_with_id(GlobalVertex::from_raw(500)).unwrap();
        let (_, next) = root.add_vertex().unwrap();
        assert_eq!(next.raw(), 501);
    }

    #[test]
    fn remove_cluster_rejects_vertex_that_is_not_a_child() {
        let root = Cluster::root();
        let (lv, _) = root.add_vertex().unwrap();
        assert!(root.remove_cluster_at(lv, |_| {}).is_err());
    }

    #[test]
    fn init_index_maps_assigns_dense_indices_after_a_gap() {
        let root = Cluster::root();
        let (v0, _) = root.add_vertex().unwrap();
        let (v1, _) = root.add_vertex().unwrap();
        let (v2, _) = root.add_vertex().unwrap();
        root.remove_vertex_local(v1, |_| {}).unwrap();
        let (v3, _) = root.add_vertex().unwrap();
        root.add_edge_local(v0, v2).unwrap();
        root.add_edge_local(v2, v3).unwrap();

        root.reset_changed();
        root.init_index_maps();
        assert!(root.changed(), "init_index_maps is a mutation");

        let mut vertex_indices: Vec<usize> = root
            .vertices()
            .into_iter()
            .map(|lv| root.vertex_property::<IndexKind>(lv).unwrap())
            .collect();
        vertex_indices.sort_unstable();
        assert_eq!(vertex_indices, (0..root.vertex_count()).collect::<Vec<_>>());

        let mut edge_indices: Vec<usize> = root
            .local_edges()
            .into_iter()
            .map(|le| root.edge_property::<IndexKind>(le).unwrap())
            .collect();
        edge_indices.sort_unstable();
        assert_eq!(edge_indices, (0..root.local_edge_count()).collect::<Vec<_>>());
    }
}
