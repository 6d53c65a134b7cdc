//! Congestion-weighted routing over a [`MultiplexGraph`].
//!
//! Arc weight is `base_travel_time + delay`, where the delay comes from the
//! congestion of the arc's segment and the configured penalty curve. The
//! congestion view is frozen once per query.
//!
//! Paths are ordered by total weight, then by stop count, then by the
//! lexicographic order of their node ids. Alternatives beyond the best path
//! come from Yen's deviation algorithm and never revisit a node.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::cancel::CancelToken;
use crate::congestion::{CongestionModel, CongestionSource, CongestionView, PenaltyCurve};
use crate::graph::{MultiplexGraph, NodeIdx};
use crate::model::{Mode, NodeId};
use crate::{Error, Result};

/// Congestion at one stop of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopCongestion {
    pub node_id: NodeId,
    pub percent: f64,
    pub source: CongestionSource,
    pub congestion_unknown: bool,
}

/// One hop of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub from: NodeId,
    pub to: NodeId,
    pub mode: Mode,
    pub route_ref: Option<String>,
    pub segment_id: String,
    pub base_travel_time: f64,
    pub delay: f64,
    pub congestion_percent: f64,
    pub congestion_unknown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCandidate {
    pub nodes: Vec<NodeId>,
    pub legs: Vec<RouteLeg>,
    /// Per-stop congestion trace, one entry per node.
    pub congestion: Vec<StopCongestion>,
    pub base_travel_time: f64,
    pub delay: f64,
    pub total_weight: f64,
    /// Mean over stops with known congestion; `None` when every stop is unknown.
    pub avg_congestion: Option<f64>,
    /// Set when any stop or leg was weighted with the neutral default.
    pub congestion_unknown: bool,
    /// Minutes from departure at which each stop is reached.
    pub arrival_offsets: Vec<f64>,
}

impl RouteCandidate {
    #[inline]
    pub fn stops(&self) -> usize {
        self.nodes.len()
    }

    pub fn congestion_values(&self) -> Vec<f64> {
        self.congestion.iter().map(|c| c.percent).collect()
    }

    /// Distinct route references in travel order.
    pub fn route_refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::new();
        for leg in &self.legs {
            if let Some(route_ref) = leg.route_ref.as_deref() {
                if !refs.contains(&route_ref) {
                    refs.push(route_ref);
                }
            }
        }
        refs
    }

    /// The route reference covering the most legs; earliest wins a tie.
    pub fn primary_route_ref(&self) -> Option<&str> {
        let refs = self.route_refs();
        let mut best: Option<(&str, usize)> = None;
        for route_ref in refs {
            let count = self
                .legs
                .iter()
                .filter(|l| l.route_ref.as_deref() == Some(route_ref))
                .count();
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((route_ref, count));
            }
        }
        best.map(|(r, _)| r)
    }
}

/// Ordered by weight, then hop count, then node sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Label {
    weight: OrderedFloat<f64>,
    hops: usize,
    path: Vec<NodeIdx>,
}

#[derive(Debug, Clone, Copy)]
struct WeightedLink {
    to: NodeIdx,
    weight: f64,
    edge: usize,
}

/// Router bound to one graph and one frozen congestion view.
pub struct Router<'g> {
    graph: &'g MultiplexGraph,
    view: CongestionView,
    edge_delay: Vec<f64>,
    /// Cheapest arc to every distinct neighbour.
    links: Vec<SmallVec<[WeightedLink; 4]>>,
}

impl<'g> Router<'g> {
    /// Freezes the congestion of every segment in `graph` as of `at`.
    pub fn new(graph: &'g MultiplexGraph, model: &CongestionModel, at: DateTime<Utc>) -> Self {
        let view = model.view(graph.segment_ids(), at);
        Self::with_view(graph, view, model.penalty())
    }

    pub fn with_view(graph: &'g MultiplexGraph, view: CongestionView, penalty: &PenaltyCurve) -> Self {
        let edge_delay: Vec<f64> = graph
            .edges()
            .iter()
            .map(|e| penalty.delay(e.base_travel_time, view.get(&e.segment_id).percent))
            .collect();

        let mut links = Vec::with_capacity(graph.node_count());
        for node in 0..graph.node_count() {
            let mut best: SmallVec<[WeightedLink; 4]> = SmallVec::new();
            for link in graph.outgoing(node) {
                let weight = graph.edge(link.edge).base_travel_time + edge_delay[link.edge];
                match best.iter_mut().find(|w| w.to == link.to) {
                    Some(existing) if weight < existing.weight => {
                        existing.weight = weight;
                        existing.edge = link.edge;
                    }
                    Some(_) => {}
                    None => best.push(WeightedLink {
                        to: link.to,
                        weight,
                        edge: link.edge,
                    }),
                }
            }
            links.push(best);
        }

        Self {
            graph,
            view,
            edge_delay,
            links,
        }
    }

    #[inline]
    pub fn graph(&self) -> &MultiplexGraph {
        self.graph
    }

    /// Up to `max_results` simple paths, best first.
    ///
    /// `max_results` below one is treated as one. Returns
    /// `InvalidEndpoints` for ids absent from the graph and `Unreachable`
    /// when no path exists.
    pub fn find_routes(
        &self,
        source: &str,
        destination: &str,
        max_results: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<RouteCandidate>> {
        let src = self.endpoint(source, "source")?;
        let dst = self.endpoint(destination, "destination")?;

        if src == dst {
            return Ok(vec![self.candidate(&[src])]);
        }

        let paths = self.k_shortest(src, dst, max_results.max(1), cancel)?;
        if paths.is_empty() {
            return Err(Error::Unreachable {
                origin: source.to_string(),
                destination: destination.to_string(),
            });
        }
        Ok(paths.iter().map(|p| self.candidate(p)).collect())
    }

    fn endpoint(&self, id: &str, role: &str) -> Result<NodeIdx> {
        self.graph.index_of(id).ok_or_else(|| {
            Error::InvalidEndpoints(format!(
                "{} {} is not in the {} graph",
                role,
                id,
                self.graph.snapshot_year()
            ))
        })
    }

    fn weight_between(&self, from: NodeIdx, to: NodeIdx) -> Option<&WeightedLink> {
        self.links[from].iter().find(|l| l.to == to)
    }

    /// Weight accumulated from the first node, in the same order the search
    /// accumulates it.
    fn path_weight(&self, path: &[NodeIdx]) -> f64 {
        path.windows(2)
            .filter_map(|pair| self.weight_between(pair[0], pair[1]))
            .fold(0.0, |acc, link| acc + link.weight)
    }

    fn label_for(&self, path: Vec<NodeIdx>) -> Label {
        Label {
            weight: OrderedFloat(self.path_weight(&path)),
            hops: path.len(),
            path,
        }
    }

    fn shortest(
        &self,
        source: NodeIdx,
        target: NodeIdx,
        banned_nodes: &[bool],
        banned_links: &AHashSet<(NodeIdx, NodeIdx)>,
        cancel: &CancelToken,
    ) -> Result<Option<Label>> {
        let n = self.graph.node_count();
        let mut best: Vec<Option<Label>> = vec![None; n];
        let mut settled = vec![false; n];
        let mut heap = BinaryHeap::new();

        let start = Label {
            weight: OrderedFloat(0.0),
            hops: 1,
            path: vec![source],
        };
        best[source] = Some(start.clone());
        heap.push(Reverse(start));

        let mut pops = 0usize;
        while let Some(Reverse(label)) = heap.pop() {
            if pops % 256 == 0 {
                cancel.check()?;
            }
            pops += 1;
            let Some(&node) = label.path.last() else {
                continue;
            };
            if settled[node] {
                continue;
            }
            settled[node] = true;
            if node == target {
                return Ok(Some(label));
            }

            for link in &self.links[node] {
                if settled[link.to] || banned_nodes[link.to] || banned_links.contains(&(node, link.to)) {
                    continue;
                }
                let mut path = Vec::with_capacity(label.path.len() + 1);
                path.extend_from_slice(&label.path);
                path.push(link.to);
                let next = Label {
                    weight: OrderedFloat(label.weight.0 + link.weight),
                    hops: label.hops + 1,
                    path,
                };
                if best[link.to].as_ref().map_or(true, |b| next < *b) {
                    best[link.to] = Some(next.clone());
                    heap.push(Reverse(next));
                }
            }
        }
        Ok(None)
    }

    /// Yen's k-shortest simple paths.
    fn k_shortest(
        &self,
        source: NodeIdx,
        target: NodeIdx,
        k: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<Vec<NodeIdx>>> {
        let n = self.graph.node_count();
        let no_links = AHashSet::new();
        let Some(first) = self.shortest(source, target, &vec![false; n], &no_links, cancel)? else {
            return Ok(Vec::new());
        };

        let mut accepted: Vec<Vec<NodeIdx>> = vec![first.path];
        let mut pending: BTreeSet<Label> = BTreeSet::new();

        while accepted.len() < k {
            cancel.check()?;
            let previous = accepted[accepted.len() - 1].clone();

            for i in 0..previous.len() - 1 {
                let spur = previous[i];
                let root = &previous[..=i];

                let mut banned_links = AHashSet::new();
                for path in &accepted {
                    if path.len() > i + 1 && &path[..=i] == root {
                        banned_links.insert((path[i], path[i + 1]));
                    }
                }
                let mut banned_nodes = vec![false; n];
                for &node in &root[..i] {
                    banned_nodes[node] = true;
                }

                if let Some(spur_path) = self.shortest(spur, target, &banned_nodes, &banned_links, cancel)? {
                    let mut path = root[..i].to_vec();
                    path.extend_from_slice(&spur_path.path);
                    if !accepted.contains(&path) {
                        pending.insert(self.label_for(path));
                    }
                }
            }

            match pending.pop_first() {
                Some(next) => accepted.push(next.path),
                None => break,
            }
        }
        Ok(accepted)
    }

    fn candidate(&self, path: &[NodeIdx]) -> RouteCandidate {
        let nodes: Vec<NodeId> = path.iter().map(|&i| self.graph.node(i).id.clone()).collect();

        let congestion: Vec<StopCongestion> = nodes
            .iter()
            .map(|id| {
                let reading = self.view.get(id);
                StopCongestion {
                    node_id: id.clone(),
                    percent: reading.percent,
                    source: reading.source,
                    congestion_unknown: reading.is_unknown(),
                }
            })
            .collect();

        let mut legs = Vec::with_capacity(path.len().saturating_sub(1));
        let mut arrival_offsets = Vec::with_capacity(path.len());
        let mut base_travel_time = 0.0;
        let mut delay = 0.0;
        let mut total_weight = 0.0;
        arrival_offsets.push(0.0);

        for pair in path.windows(2) {
            let Some(link) = self.weight_between(pair[0], pair[1]) else {
                continue;
            };
            let edge = self.graph.edge(link.edge);
            let reading = self.view.get(&edge.segment_id);
            let leg_delay = self.edge_delay[link.edge];

            base_travel_time += edge.base_travel_time;
            delay += leg_delay;
            total_weight += link.weight;
            arrival_offsets.push(total_weight);

            legs.push(RouteLeg {
                from: self.graph.node(pair[0]).id.clone(),
                to: self.graph.node(pair[1]).id.clone(),
                mode: edge.mode,
                route_ref: edge.route_ref.clone(),
                segment_id: edge.segment_id.clone(),
                base_travel_time: edge.base_travel_time,
                delay: leg_delay,
                congestion_percent: reading.percent,
                congestion_unknown: reading.is_unknown(),
            });
        }

        let known: Vec<f64> = congestion
            .iter()
            .filter(|c| !c.congestion_unknown)
            .map(|c| c.percent)
            .collect();
        let avg_congestion = (!known.is_empty()).then(|| known.iter().sum::<f64>() / known.len() as f64);
        let congestion_unknown =
            congestion.iter().any(|c| c.congestion_unknown) || legs.iter().any(|l| l.congestion_unknown);

        RouteCandidate {
            nodes,
            legs,
            congestion,
            base_travel_time,
            delay,
            total_weight,
            avg_congestion,
            congestion_unknown,
            arrival_offsets,
        }
    }
}

/// Convenience wrapper: freeze congestion at `at` and search once.
pub fn find_routes(
    graph: &MultiplexGraph,
    model: &CongestionModel,
    source: &str,
    destination: &str,
    max_results: usize,
    at: DateTime<Utc>,
    cancel: &CancelToken,
) -> Result<Vec<RouteCandidate>> {
    Router::new(graph, model, at).find_routes(source, destination, max_results, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::config::CongestionConfig;
    use crate::congestion::{CongestionSample, CongestionStore};
    use crate::graph::GraphFilter;
    use crate::model::{Edge, Node, NodeKind, YearSnapshot};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
    }

    fn stop(id: &str, i: usize) -> Node {
        Node::new(id, NodeKind::BusStop, 12.9 + i as f64 * 0.01, 77.6, 2014)
    }

    fn graph(nodes: Vec<Node>, edges: Vec<Edge>) -> MultiplexGraph {
        let snapshot = YearSnapshot::new(2020, nodes, edges, vec![]).unwrap();
        MultiplexGraph::build(&snapshot, GraphFilter::ALL, 2.0, &CancelToken::new()).unwrap()
    }

    fn linear() -> (Vec<Node>, Vec<Edge>) {
        let ids = ["A", "B", "C", "D", "E"];
        let nodes = ids.iter().enumerate().map(|(i, id)| stop(id, i)).collect();
        let edges = ids
            .windows(2)
            .map(|p| Edge::new(p[0], p[1], Mode::BusRoute, 5.0).with_route("line"))
            .collect();
        (nodes, edges)
    }

    fn model_with(samples: &[(&str, f64)], penalty: PenaltyCurve) -> CongestionModel {
        let store = Arc::new(CongestionStore::new());
        for (segment, percent) in samples {
            store.append(CongestionSample::new(*segment, now(), *percent).unwrap());
        }
        CongestionModel::new(
            store,
            CongestionConfig {
                freshness_window_minutes: 15,
                penalty,
                ..CongestionConfig::default()
            },
        )
    }

    #[test]
    fn test_linear_graph_free_flow() {
        let (nodes, edges) = linear();
        let graph = graph(nodes, edges);
        let samples: Vec<(&str, f64)> = ["A", "B", "C", "D", "E"].iter().map(|id| (*id, 0.0)).collect();
        let model = model_with(&samples, PenaltyCurve::default());

        let routes = find_routes(&graph, &model, "A", "E", 3, now(), &CancelToken::new()).unwrap();
        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        assert_eq!(route.total_weight, 20.0);
        assert_eq!(route.delay, 0.0);
        assert_eq!(route.avg_congestion, Some(0.0));
        assert!(!route.congestion_unknown);
        assert_eq!(route.arrival_offsets, vec![0.0, 5.0, 10.0, 15.0, 20.0]);
        assert_eq!(route.primary_route_ref(), Some("line"));
    }

    #[test]
    fn test_congested_segment_prefers_parallel_detour() {
        let (mut nodes, mut edges) = linear();
        edges.retain(|e| !(e.from == "C" && e.to == "D"));
        edges.push(Edge::new("C", "D", Mode::BusRoute, 5.0).with_segment("seg-CD"));
        nodes.push(stop("D'", 9));
        edges.push(Edge::new("C", "D'", Mode::BusRoute, 4.0));
        edges.push(Edge::new("D'", "D", Mode::BusRoute, 4.0));
        let graph = graph(nodes, edges);

        let penalty = PenaltyCurve::Threshold {
            threshold: 70.0,
            multiplier: 1.0,
        };
        let model = model_with(&[("seg-CD", 90.0)], penalty);
        let routes = find_routes(&graph, &model, "A", "E", 2, now(), &CancelToken::new()).unwrap();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].nodes, vec!["A", "B", "C", "D'", "D", "E"]);
        assert_eq!(routes[0].total_weight, 23.0);
        assert_eq!(routes[1].nodes, vec!["A", "B", "C", "D", "E"]);
        assert_eq!(routes[1].total_weight, 25.0);
        assert_eq!(routes[1].delay, 5.0);

        // Every stop is unknown here, so nothing is averaged.
        assert_eq!(routes[0].avg_congestion, None);
        assert!(routes[0].congestion_unknown);
    }

    #[test]
    fn test_unknown_stops_excluded_from_average() {
        let (nodes, edges) = linear();
        let graph = graph(nodes, edges);
        let model = model_with(&[("A", 40.0), ("C", 80.0)], PenaltyCurve::default());
        let routes = find_routes(&graph, &model, "A", "C", 1, now(), &CancelToken::new()).unwrap();

        let route = &routes[0];
        assert_eq!(route.avg_congestion, Some(60.0));
        assert!(route.congestion[1].congestion_unknown);
        assert!(route.congestion_unknown);
        assert!(route.congestion.iter().all(|c| (0.0..=100.0).contains(&c.percent)));
    }

    #[test]
    fn test_ties_break_on_stops_then_ids() {
        let nodes = vec![stop("S", 0), stop("X", 1), stop("Y", 2), stop("M", 3), stop("T", 4)];
        let edges = vec![
            Edge::new("S", "Y", Mode::BusRoute, 2.0),
            Edge::new("Y", "T", Mode::BusRoute, 2.0),
            Edge::new("S", "X", Mode::BusRoute, 2.0),
            Edge::new("X", "T", Mode::BusRoute, 2.0),
            Edge::new("S", "M", Mode::BusRoute, 1.0),
            Edge::new("M", "X", Mode::BusRoute, 1.0),
        ];
        let graph = graph(nodes, edges);
        let model = model_with(&[], PenaltyCurve::default());
        let routes = find_routes(&graph, &model, "S", "T", 3, now(), &CancelToken::new()).unwrap();

        let paths: Vec<Vec<NodeId>> = routes.iter().map(|r| r.nodes.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec!["S".to_string(), "X".into(), "T".into()],
                vec!["S".to_string(), "Y".into(), "T".into()],
                vec!["S".to_string(), "M".into(), "X".into(), "T".into()],
            ]
        );
    }

    #[test]
    fn test_endpoint_errors() {
        let (nodes, edges) = linear();
        let mut nodes = nodes;
        nodes.push(stop("Z", 8));
        let graph = graph(nodes, edges);
        let model = model_with(&[], PenaltyCurve::default());
        let cancel = CancelToken::new();

        assert!(matches!(
            find_routes(&graph, &model, "A", "nowhere", 1, now(), &cancel),
            Err(Error::InvalidEndpoints(_))
        ));
        assert!(matches!(
            find_routes(&graph, &model, "A", "Z", 1, now(), &cancel),
            Err(Error::Unreachable { .. })
        ));

        let same = find_routes(&graph, &model, "B", "B", 5, now(), &cancel).unwrap();
        assert_eq!(same.len(), 1);
        assert_eq!(same[0].total_weight, 0.0);
        assert_eq!(same[0].nodes, vec!["B"]);
    }

    #[test]
    fn test_directed_road_segments() {
        let nodes = vec![
            Node::new("j1", NodeKind::RoadJunction, 12.9, 77.6, 2014),
            Node::new("j2", NodeKind::RoadJunction, 12.91, 77.6, 2014),
        ];
        let graph = graph(nodes, vec![Edge::new("j1", "j2", Mode::RoadSegment, 3.0)]);
        let model = model_with(&[], PenaltyCurve::default());
        let cancel = CancelToken::new();
        assert!(find_routes(&graph, &model, "j1", "j2", 1, now(), &cancel).is_ok());
        assert!(matches!(
            find_routes(&graph, &model, "j2", "j1", 1, now(), &cancel),
            Err(Error::Unreachable { .. })
        ));
    }

    #[test]
    fn test_cancelled_search() {
        let (nodes, edges) = linear();
        let graph = graph(nodes, edges);
        let model = model_with(&[], PenaltyCurve::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            find_routes(&graph, &model, "A", "E", 4, now(), &cancel),
            Err(Error::Cancelled)
        ));
    }

    fn brute_force_best(router: &Router, src: NodeIdx, dst: NodeIdx) -> Option<f64> {
        fn walk(router: &Router, node: NodeIdx, dst: NodeIdx, seen: &mut Vec<bool>, cost: f64, best: &mut Option<f64>) {
            if node == dst {
                if best.map_or(true, |b| cost < b) {
                    *best = Some(cost);
                }
                return;
            }
            for link in &router.links[node] {
                if !seen[link.to] {
                    seen[link.to] = true;
                    walk(router, link.to, dst, seen, cost + link.weight, best);
                    seen[link.to] = false;
                }
            }
        }
        let mut seen = vec![false; router.graph.node_count()];
        seen[src] = true;
        let mut best = None;
        walk(router, src, dst, &mut seen, 0.0, &mut best);
        best
    }

    #[test]
    fn test_matches_exhaustive_search_on_random_fixtures() {
        let mut rng = StdRng::seed_from_u64(11);
        for round in 0..20 {
            let count = 8;
            let nodes: Vec<Node> = (0..count).map(|i| stop(&format!("n{}", i), i)).collect();
            let mut edges = Vec::new();
            for a in 0..count {
                for b in 0..count {
                    if a != b && rng.random_range(0.0..1.0) < 0.3 {
                        let time = f64::from(rng.random_range(1..10u32));
                        edges.push(
                            Edge::new(format!("n{}", a), format!("n{}", b), Mode::RoadSegment, time)
                                .with_segment(format!("s{}-{}", a, b)),
                        );
                    }
                }
            }
            let samples: Vec<(String, f64)> = edges
                .iter()
                .filter_map(|e| e.segment_id.clone())
                .map(|s| (s, f64::from(rng.random_range(0..=100u32))))
                .collect();
            let sample_refs: Vec<(&str, f64)> = samples.iter().map(|(s, p)| (s.as_str(), *p)).collect();
            let graph = graph(nodes, edges);
            let model = model_with(&sample_refs, PenaltyCurve::default());
            let router = Router::new(&graph, &model, now());

            for dst in 1..count {
                let expected = brute_force_best(&router, 0, dst);
                let result = router.find_routes("n0", &format!("n{}", dst), 3, &CancelToken::new());
                match expected {
                    None => assert!(matches!(result, Err(Error::Unreachable { .. })), "round {}", round),
                    Some(best) => {
                        let routes = result.unwrap();
                        assert!((routes[0].total_weight - best).abs() < 1e-9, "round {}", round);
                        for pair in routes.windows(2) {
                            assert!(pair[0].total_weight <= pair[1].total_weight + 1e-9);
                        }
                        for route in &routes {
                            let unique: AHashSet<&NodeId> = route.nodes.iter().collect();
                            assert_eq!(unique.len(), route.nodes.len());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_repeated_queries_are_identical() {
        let (mut nodes, mut edges) = linear();
        nodes.push(stop("F", 6));
        edges.push(Edge::new("B", "F", Mode::BusRoute, 5.0));
        edges.push(Edge::new("F", "D", Mode::BusRoute, 5.0));
        let graph = graph(nodes, edges);
        let model = model_with(&[("C", 50.0), ("F", 50.0)], PenaltyCurve::default());

        let first = find_routes(&graph, &model, "A", "E", 4, now(), &CancelToken::new()).unwrap();
        for _ in 0..5 {
            let again = find_routes(&graph, &model, "A", "E", 4, now(), &CancelToken::new()).unwrap();
            assert_eq!(first, again);
        }
    }
}
