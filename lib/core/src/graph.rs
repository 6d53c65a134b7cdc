//! Multiplex graph construction and the graph-handle cache.
//!
//! A [`MultiplexGraph`] is built once from a [`YearSnapshot`] and a
//! [`GraphFilter`] and is never mutated afterwards; callers share it through
//! [`GraphHandle`]. Node indices follow node-id order, so comparing two
//! indices is the same as comparing the ids.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::model::{Edge, Mode, Node, NodeId, NodeKind, YearSnapshot};
use crate::store::GeoEntityStore;
use crate::Result;

pub type NodeIdx = usize;

/// Legend toggles, applied when the graph is built.
///
/// Road junctions and road segments are always kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphFilter {
    pub include_bus: bool,
    pub include_metro: bool,
    pub include_construction: bool,
}

impl GraphFilter {
    pub const ALL: GraphFilter = GraphFilter {
        include_bus: true,
        include_metro: true,
        include_construction: true,
    };

    #[inline]
    pub fn admits_node(&self, kind: NodeKind) -> bool {
        match kind {
            NodeKind::BusStop => self.include_bus,
            NodeKind::MetroStation => self.include_metro,
            NodeKind::MetroUnderConstruction => self.include_construction,
            NodeKind::RoadJunction => true,
        }
    }

    #[inline]
    pub fn admits_mode(&self, mode: Mode) -> bool {
        match mode {
            Mode::BusRoute => self.include_bus,
            Mode::MetroLine => self.include_metro || self.include_construction,
            Mode::RoadSegment => true,
        }
    }
}

impl Default for GraphFilter {
    fn default() -> Self {
        Self::ALL
    }
}

/// A directed arc. Undirected edges are stored as two arcs.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub from: NodeIdx,
    pub to: NodeIdx,
    pub mode: Mode,
    pub route_ref: Option<String>,
    pub base_travel_time: f64,
    /// Congestion segment this arc is weighted by.
    pub segment_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub to: NodeIdx,
    pub edge: usize,
}

#[derive(Debug)]
pub struct MultiplexGraph {
    snapshot_year: i32,
    filter: GraphFilter,
    nodes: Vec<Node>,
    index: AHashMap<NodeId, NodeIdx>,
    edges: Vec<GraphEdge>,
    outgoing: Vec<SmallVec<[Link; 4]>>,
    degree: Vec<u32>,
}

/// Read-only shared handle to a built graph.
pub type GraphHandle = Arc<MultiplexGraph>;

impl MultiplexGraph {
    /// Materialises trip edges, merges explicit edges and applies `filter`.
    ///
    /// Parallel arcs between the same ordered pair and mode collapse to the
    /// fastest one; on equal times the smaller route reference is kept.
    pub fn build(
        snapshot: &YearSnapshot,
        filter: GraphFilter,
        default_hop_minutes: f64,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let nodes: Vec<Node> = snapshot
            .nodes()
            .iter()
            .filter(|n| filter.admits_node(n.kind))
            .cloned()
            .collect();
        let index: AHashMap<NodeId, NodeIdx> = nodes
            .iter()
            .enumerate()
            .map(|(idx, n)| (n.id.clone(), idx))
            .collect();

        let mut merged: BTreeMap<(NodeIdx, NodeIdx, Mode), GraphEdge> = BTreeMap::new();
        let mut add_arc = |from: NodeIdx, to: NodeIdx, edge: &Edge, segment_id: String| {
            let candidate = GraphEdge {
                from,
                to,
                mode: edge.mode,
                route_ref: edge.route_ref.clone(),
                base_travel_time: edge.base_travel_time,
                segment_id,
            };
            merged
                .entry((from, to, edge.mode))
                .and_modify(|current| {
                    let faster = candidate.base_travel_time < current.base_travel_time;
                    let tie = candidate.base_travel_time == current.base_travel_time
                        && candidate.route_ref < current.route_ref;
                    if faster || tie {
                        *current = candidate.clone();
                    }
                })
                .or_insert(candidate);
        };

        let mut materialized = Vec::new();
        for trip in snapshot.trips() {
            cancel.check()?;
            if filter.admits_mode(trip.mode) {
                materialized.extend(trip.materialize_edges(default_hop_minutes)?);
            }
        }

        for (i, edge) in snapshot.edges().iter().chain(materialized.iter()).enumerate() {
            if i % 1024 == 0 {
                cancel.check()?;
            }
            if !filter.admits_mode(edge.mode) {
                continue;
            }
            let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) else {
                continue;
            };
            let forward_segment = edge.segment_id.clone().unwrap_or_else(|| edge.to.clone());
            add_arc(from, to, edge, forward_segment);
            if !edge.directed {
                let backward_segment = edge.segment_id.clone().unwrap_or_else(|| edge.from.clone());
                add_arc(to, from, edge, backward_segment);
            }
        }

        let edges: Vec<GraphEdge> = merged.into_values().collect();
        let mut outgoing: Vec<SmallVec<[Link; 4]>> = vec![SmallVec::new(); nodes.len()];
        let mut degree = vec![0u32; nodes.len()];
        for (edge_idx, edge) in edges.iter().enumerate() {
            outgoing[edge.from].push(Link {
                to: edge.to,
                edge: edge_idx,
            });
            degree[edge.from] += 1;
            degree[edge.to] += 1;
        }

        Ok(Self {
            snapshot_year: snapshot.year(),
            filter,
            nodes,
            index,
            edges,
            outgoing,
            degree,
        })
    }

    /// Year of the snapshot the graph was built from.
    #[inline]
    pub fn snapshot_year(&self) -> i32 {
        self.snapshot_year
    }

    #[inline]
    pub fn filter(&self) -> GraphFilter {
        self.filter
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx]
    }

    #[inline]
    pub fn index_of(&self, id: &str) -> Option<NodeIdx> {
        self.index.get(id).copied()
    }

    #[inline]
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    #[inline]
    pub fn edge(&self, idx: usize) -> &GraphEdge {
        &self.edges[idx]
    }

    #[inline]
    pub fn outgoing(&self, idx: NodeIdx) -> &[Link] {
        &self.outgoing[idx]
    }

    /// Number of arcs touching the node, in either direction.
    #[inline]
    pub fn degree(&self, idx: NodeIdx) -> u32 {
        self.degree[idx]
    }

    /// Case-insensitive lookup by id, then display name.
    pub fn resolve(&self, id_or_name: &str) -> Option<NodeIdx> {
        if let Some(idx) = self.index_of(id_or_name) {
            return Some(idx);
        }
        let wanted = id_or_name.trim().to_lowercase();
        self.nodes
            .iter()
            .position(|n| n.display_name().to_lowercase() == wanted)
    }

    /// Every segment an arc or a stop may be weighted by.
    pub fn segment_ids(&self) -> impl Iterator<Item = &str> {
        self.edges
            .iter()
            .map(|e| e.segment_id.as_str())
            .chain(self.nodes.iter().map(|n| n.id.as_str()))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Sorted `(from, to, mode, base_travel_time)` tuples.
    pub fn edge_keys(&self) -> Vec<(NodeId, NodeId, Mode, f64)> {
        let mut keys: Vec<_> = self
            .edges
            .iter()
            .map(|e| {
                (
                    self.nodes[e.from].id.clone(),
                    self.nodes[e.to].id.clone(),
                    e.mode,
                    e.base_travel_time,
                )
            })
            .collect();
        keys.sort_by(|a, b| {
            (&a.0, &a.1, a.2)
                .cmp(&(&b.0, &b.1, b.2))
                .then_with(|| a.3.total_cmp(&b.3))
        });
        keys
    }
}

type CacheKey = (i32, GraphFilter);

struct CacheEntry {
    graph: GraphHandle,
    generation: u64,
    last_access: AtomicU64,
}

/// Bounded LRU cache of built graphs keyed by `(snapshot year, filter)`.
///
/// Lookups run under the read lock and refresh recency through an atomic
/// tick; insertion and eviction take the write lock.
pub struct GraphCache {
    entries: RwLock<AHashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl GraphCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(AHashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Entry for `key` built from `generation`, if still cached.
    pub fn get(&self, key: &CacheKey, generation: u64) -> Option<GraphHandle> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.generation == generation => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.graph.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `graph`, or returns the equivalent graph a concurrent build
    /// already stored.
    pub fn insert(&self, key: CacheKey, generation: u64, graph: GraphHandle) -> GraphHandle {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if existing.generation == generation {
                existing.last_access.store(self.tick(), Ordering::Relaxed);
                return existing.graph.clone();
            }
        }

        entries.remove(&key);
        while entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                .map(|(k, _)| *k);
            match oldest {
                Some(evicted) => {
                    debug!("Evicting graph for year {} {:?}", evicted.0, evicted.1);
                    entries.remove(&evicted);
                }
                None => break,
            }
        }

        entries.insert(
            key,
            CacheEntry {
                graph: graph.clone(),
                generation,
                last_access: AtomicU64::new(self.tick()),
            },
        );
        graph
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// Builds and caches [`GraphHandle`]s from the [`GeoEntityStore`].
pub struct GraphBuilder {
    store: Arc<GeoEntityStore>,
    cache: GraphCache,
    default_hop_minutes: f64,
}

impl GraphBuilder {
    pub fn new(store: Arc<GeoEntityStore>, cache_capacity: usize, default_hop_minutes: f64) -> Self {
        Self {
            store,
            cache: GraphCache::new(cache_capacity),
            default_hop_minutes,
        }
    }

    #[inline]
    pub fn cache(&self) -> &GraphCache {
        &self.cache
    }

    pub fn build(&self, year: i32, filter: GraphFilter) -> Result<GraphHandle> {
        self.build_with_cancel(year, filter, &CancelToken::new())
    }

    /// Fails with `OutOfRangeYear` outside the covered years. Years served by
    /// the same snapshot share one cached graph. A cancelled build returns
    /// `Cancelled` and leaves the cache untouched.
    pub fn build_with_cancel(&self, year: i32, filter: GraphFilter, cancel: &CancelToken) -> Result<GraphHandle> {
        let generation = self.store.generation();
        let snapshot = self.store.snapshot_for(year)?;
        let key = (snapshot.year(), filter);

        if let Some(graph) = self.cache.get(&key, generation) {
            debug!("Graph cache hit for {} ({} snapshot) {:?}", year, snapshot.year(), filter);
            return Ok(graph);
        }

        let started = std::time::Instant::now();
        let graph = MultiplexGraph::build(&snapshot, filter, self.default_hop_minutes, cancel)?;
        info!(
            "Built graph for {} from {} snapshot: {} nodes, {} arcs in {:?}",
            year,
            snapshot.year(),
            graph.node_count(),
            graph.edge_count(),
            started.elapsed()
        );
        Ok(self.cache.insert(key, generation, Arc::new(graph)))
    }
}
