//! Transit entities as handed over by ingestion: nodes, edges, trips and the
//! immutable per-year snapshot that groups them.

use ahash::{AHashMap, AHashSet};
use geo::{Distance, Haversine};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Stable node identifier, shared across years.
pub type NodeId = String;

/// What a node is on the map.
///
/// The only kind change a node may go through across years is
/// `MetroUnderConstruction -> MetroStation`, see [`NodeKind::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    BusStop,
    MetroStation,
    MetroUnderConstruction,
    RoadJunction,
}

impl NodeKind {
    pub const ALL: [NodeKind; 4] = [
        NodeKind::BusStop,
        NodeKind::MetroStation,
        NodeKind::MetroUnderConstruction,
        NodeKind::RoadJunction,
    ];

    /// Allowed-transition table. Staying the same kind is always allowed.
    #[inline]
    pub fn can_transition_to(self, next: NodeKind) -> bool {
        self == next
            || matches!(
                (self, next),
                (NodeKind::MetroUnderConstruction, NodeKind::MetroStation)
            )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::BusStop => "bus_stop",
            NodeKind::MetroStation => "metro_station",
            NodeKind::MetroUnderConstruction => "metro_under_construction",
            NodeKind::RoadJunction => "road_junction",
        }
    }

    /// The edge layer a node of this kind normally attaches to.
    pub fn layer(self) -> Mode {
        match self {
            NodeKind::BusStop => Mode::BusRoute,
            NodeKind::MetroStation | NodeKind::MetroUnderConstruction => Mode::MetroLine,
            NodeKind::RoadJunction => Mode::RoadSegment,
        }
    }
}

/// Edge layer of the multiplex graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    BusRoute,
    MetroLine,
    RoadSegment,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::BusRoute => "bus_route",
            Mode::MetroLine => "metro_line",
            Mode::RoadSegment => "road_segment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Human readable stop name. Empty means "use the id".
    #[serde(default)]
    pub name: String,
    pub kind: NodeKind,
    pub lat: f64,
    pub lon: f64,
    pub first_seen: i32,
    /// `None` while the node is still present.
    #[serde(default)]
    pub last_seen: Option<i32>,
}

impl Node {
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: NodeKind, lat: f64, lon: f64, first_seen: i32) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            kind,
            lat,
            lon,
            first_seen,
            last_seen: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn retired_after(mut self, last_seen: i32) -> Self {
        self.last_seen = Some(last_seen);
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    #[inline]
    pub fn is_present_in(&self, year: i32) -> bool {
        self.first_seen <= year && self.last_seen.map_or(true, |last| year <= last)
    }

    /// Position as a `geo` point (x = longitude, y = latitude).
    #[inline]
    pub fn point(&self) -> geo::Point<f64> {
        geo::Point::new(self.lon, self.lat)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub mode: Mode,
    /// Trip or route this edge was materialised from, if any.
    #[serde(default)]
    pub route_ref: Option<String>,
    /// Free-flow travel time in minutes.
    pub base_travel_time: f64,
    pub directed: bool,
    /// Congestion segment. Falls back to the head node id when absent.
    #[serde(default)]
    pub segment_id: Option<String>,
}

impl Edge {
    /// Road segments are directed, rail and bus adjacency is not.
    #[inline]
    #[must_use]
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>, mode: Mode, base_travel_time: f64) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            mode,
            route_ref: None,
            base_travel_time,
            directed: mode == Mode::RoadSegment,
            segment_id: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_route(mut self, route_ref: impl Into<String>) -> Self {
        self.route_ref = Some(route_ref.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_segment(mut self, segment_id: impl Into<String>) -> Self {
        self.segment_id = Some(segment_id.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn one_way(mut self) -> Self {
        self.directed = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn two_way(mut self) -> Self {
        self.directed = false;
        self
    }
}

/// A named ordered stop sequence. Consecutive stops become edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_name: String,
    pub mode: Mode,
    pub stops: Vec<NodeId>,
    /// Minutes between consecutive stops; empty means the configured default hop.
    #[serde(default)]
    pub hop_times: Vec<f64>,
    #[serde(default)]
    pub one_way: bool,
}

impl Trip {
    pub fn new(
        trip_id: impl Into<String>,
        route_name: impl Into<String>,
        mode: Mode,
        stops: Vec<NodeId>,
    ) -> Self {
        Self {
            trip_id: trip_id.into(),
            route_name: route_name.into(),
            mode,
            stops,
            hop_times: Vec::new(),
            one_way: false,
        }
    }

    #[must_use]
    pub fn with_hop_times(mut self, hop_times: Vec<f64>) -> Self {
        self.hop_times = hop_times;
        self
    }

    /// Edges between consecutive stops.
    pub fn materialize_edges(&self, default_hop_minutes: f64) -> Result<Vec<Edge>> {
        if self.stops.len() < 2 {
            return Ok(Vec::new());
        }
        let hops = self.stops.len() - 1;
        if !self.hop_times.is_empty() && self.hop_times.len() != hops {
            return Err(Error::DataInconsistency(format!(
                "trip {} has {} stops but {} hop times",
                self.trip_id,
                self.stops.len(),
                self.hop_times.len()
            )));
        }

        let mut edges = Vec::with_capacity(hops);
        for (i, pair) in self.stops.windows(2).enumerate() {
            if pair[0] == pair[1] {
                return Err(Error::DataInconsistency(format!(
                    "trip {} repeats stop {} consecutively",
                    self.trip_id, pair[0]
                )));
            }
            let minutes = self.hop_times.get(i).copied().unwrap_or(default_hop_minutes);
            let mut edge = Edge::new(pair[0].clone(), pair[1].clone(), self.mode, minutes)
                .with_route(self.trip_id.clone());
            edge.directed = self.one_way;
            edges.push(edge);
        }
        Ok(edges)
    }
}

/// Immutable view of the network as of one year.
///
/// A new year is a new snapshot; nothing here is ever patched in place.
#[derive(Debug, Clone)]
pub struct YearSnapshot {
    year: i32,
    nodes: Vec<Node>,
    node_index: AHashMap<NodeId, usize>,
    edges: Vec<Edge>,
    trips: Vec<Trip>,
}

impl YearSnapshot {
    /// Validates and freezes a batch of records.
    ///
    /// Duplicate ids, nodes outside their lifetime and edges or trips that
    /// reference unknown nodes are surfaced as [`Error::DataInconsistency`].
    pub fn new(year: i32, mut nodes: Vec<Node>, edges: Vec<Edge>, trips: Vec<Trip>) -> Result<Self> {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut node_index = AHashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            if !(-90.0..=90.0).contains(&node.lat) || !(-180.0..=180.0).contains(&node.lon) {
                return Err(Error::DataInconsistency(format!(
                    "node {} has invalid coordinates ({}, {})",
                    node.id, node.lat, node.lon
                )));
            }
            if !node.is_present_in(year) {
                return Err(Error::DataInconsistency(format!(
                    "node {} (seen {}..{:?}) is not present in {}",
                    node.id, node.first_seen, node.last_seen, year
                )));
            }
            if node_index.insert(node.id.clone(), idx).is_some() {
                return Err(Error::DataInconsistency(format!(
                    "duplicate node id {} in {} snapshot",
                    node.id, year
                )));
            }
        }

        for edge in &edges {
            for endpoint in [&edge.from, &edge.to] {
                if !node_index.contains_key(endpoint) {
                    return Err(Error::DataInconsistency(format!(
                        "edge {} -> {} references node {} absent from the {} snapshot",
                        edge.from, edge.to, endpoint, year
                    )));
                }
            }
            if !edge.base_travel_time.is_finite() || edge.base_travel_time < 0.0 {
                return Err(Error::DataInconsistency(format!(
                    "edge {} -> {} has invalid travel time {}",
                    edge.from, edge.to, edge.base_travel_time
                )));
            }
        }

        let mut trip_ids = AHashSet::with_capacity(trips.len());
        for trip in &trips {
            if !trip_ids.insert(trip.trip_id.as_str()) {
                return Err(Error::DataInconsistency(format!(
                    "duplicate trip id {} in {} snapshot",
                    trip.trip_id, year
                )));
            }
            if let Some(missing) = trip.stops.iter().find(|s| !node_index.contains_key(*s)) {
                return Err(Error::DataInconsistency(format!(
                    "trip {} references stop {} absent from the {} snapshot",
                    trip.trip_id, missing, year
                )));
            }
            if trip.hop_times.iter().any(|t| !t.is_finite() || *t < 0.0) {
                return Err(Error::DataInconsistency(format!(
                    "trip {} has an invalid hop time",
                    trip.trip_id
                )));
            }
        }

        Ok(Self {
            year,
            nodes,
            node_index,
            edges,
            trips,
        })
    }

    #[inline]
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Nodes sorted by id.
    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[inline]
    pub fn trips(&self) -> &[Trip] {
        &self.trips
    }

    #[inline]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&idx| &self.nodes[idx])
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.node_index.contains_key(id)
    }

    pub fn trip(&self, trip_id: &str) -> Option<&Trip> {
        self.trips.iter().find(|t| t.trip_id == trip_id)
    }

    /// Sorted, de-duplicated display names of every stop and station.
    pub fn stop_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.kind != NodeKind::RoadJunction)
            .map(|n| n.display_name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Case-insensitive lookup by id first, then by display name.
    pub fn resolve_stop(&self, id_or_name: &str) -> Option<&Node> {
        if let Some(node) = self.node(id_or_name) {
            return Some(node);
        }
        let wanted = id_or_name.trim().to_lowercase();
        self.nodes
            .iter()
            .find(|n| n.display_name().to_lowercase() == wanted)
    }

    /// Closest node to `(lat, lon)` by great-circle distance, with that
    /// distance in meters. Ties go to the smaller id.
    pub fn nearest_node(&self, lat: f64, lon: f64) -> Option<(&Node, f64)> {
        let target = geo::Point::new(lon, lat);
        self.nodes
            .iter()
            .map(|n| (n, Haversine.distance(n.point(), target)))
            .min_by(|(a, da), (b, db)| da.total_cmp(db).then_with(|| a.id.cmp(&b.id)))
    }
}
