//! Node-removal criticality ranking.
//!
//! The loss of a node is the number of ordered `(s, t)` pairs, neither of
//! them the removed node, that were connected before removal and afterwards
//! are either disconnected or cost more than `(1 + cost_increase_ratio)`
//! times their original shortest-path cost. Costs use base travel times, so
//! the ranking does not move with live congestion.
//!
//! Up to `exact_node_limit` nodes every source is evaluated. Larger graphs
//! evaluate a seeded sample of `sample_sources` sources and scale the counts
//! by `node_count / sample_size`; those scores are flagged `approximate`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cancel::CancelToken;
use crate::config::CriticalityConfig;
use crate::graph::{MultiplexGraph, NodeIdx};
use crate::model::{NodeId, NodeKind};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalityScore {
    pub node_id: NodeId,
    pub kind: NodeKind,
    /// Disconnected plus degraded pairs, scaled when sampled.
    pub loss: f64,
    pub disconnected_pairs: u64,
    pub degraded_pairs: u64,
    /// 1-based.
    pub rank: usize,
    pub approximate: bool,
}

pub struct CriticalNodeAnalyzer {
    config: CriticalityConfig,
}

impl CriticalNodeAnalyzer {
    pub fn new(config: CriticalityConfig) -> Self {
        Self { config }
    }

    /// Top `top_k` nodes by connectivity loss, ties broken by node id.
    pub fn rank(&self, graph: &MultiplexGraph, top_k: usize, cancel: &CancelToken) -> Result<Vec<CriticalityScore>> {
        let started = Instant::now();
        let n = graph.node_count();
        if n == 0 || top_k == 0 {
            return Ok(Vec::new());
        }

        let links = base_links(graph);
        let approximate = n > self.config.exact_node_limit;
        let sources: Vec<NodeIdx> = if approximate {
            let mut rng = StdRng::seed_from_u64(self.config.seed);
            let amount = self.config.sample_sources.min(n);
            let mut picked = rand::seq::index::sample(&mut rng, n, amount).into_vec();
            picked.sort_unstable();
            picked
        } else {
            (0..n).collect()
        };
        let scale = if approximate {
            n as f64 / sources.len() as f64
        } else {
            1.0
        };

        let baseline: Vec<Vec<f64>> = sources
            .par_iter()
            .map(|&s| shortest_costs(&links, s, None, cancel))
            .collect::<Result<_>>()?;

        let ratio = self.config.cost_increase_ratio;
        let counts: Vec<(u64, u64)> = (0..n)
            .into_par_iter()
            .map(|removed| -> Result<(u64, u64)> {
                let mut disconnected = 0u64;
                let mut degraded = 0u64;
                if graph.degree(removed) == 0 {
                    return Ok((0, 0));
                }
                for (slot, &source) in sources.iter().enumerate() {
                    if source == removed {
                        continue;
                    }
                    let before = &baseline[slot];
                    let after = shortest_costs(&links, source, Some(removed), cancel)?;
                    for target in 0..n {
                        if target == source || target == removed || !before[target].is_finite() {
                            continue;
                        }
                        if !after[target].is_finite() {
                            disconnected += 1;
                        } else if after[target] > before[target] * (1.0 + ratio) {
                            degraded += 1;
                        }
                    }
                }
                Ok((disconnected, degraded))
            })
            .collect::<Result<_>>()?;

        let mut scores: Vec<CriticalityScore> = counts
            .into_iter()
            .enumerate()
            .map(|(idx, (disconnected, degraded))| {
                let node = graph.node(idx);
                CriticalityScore {
                    node_id: node.id.clone(),
                    kind: node.kind,
                    loss: (disconnected + degraded) as f64 * scale,
                    disconnected_pairs: disconnected,
                    degraded_pairs: degraded,
                    rank: 0,
                    approximate,
                }
            })
            .collect();

        scores.sort_by(|a, b| b.loss.total_cmp(&a.loss).then_with(|| a.node_id.cmp(&b.node_id)));
        scores.truncate(top_k);
        for (i, score) in scores.iter_mut().enumerate() {
            score.rank = i + 1;
        }

        info!(
            "Ranked {} nodes ({} sources{}) in {:?}",
            n,
            sources.len(),
            if approximate { ", sampled" } else { "" },
            started.elapsed()
        );
        Ok(scores)
    }
}

/// Cheapest base travel time to every distinct neighbour.
fn base_links(graph: &MultiplexGraph) -> Vec<Vec<(NodeIdx, f64)>> {
    (0..graph.node_count())
        .map(|node| {
            let mut out: Vec<(NodeIdx, f64)> = Vec::with_capacity(graph.outgoing(node).len());
            for link in graph.outgoing(node) {
                let time = graph.edge(link.edge).base_travel_time;
                match out.iter_mut().find(|(to, _)| *to == link.to) {
                    Some(existing) => existing.1 = existing.1.min(time),
                    None => out.push((link.to, time)),
                }
            }
            out
        })
        .collect()
}

/// Single-source costs; unreachable targets are `f64::INFINITY`.
fn shortest_costs(
    links: &[Vec<(NodeIdx, f64)>],
    source: NodeIdx,
    removed: Option<NodeIdx>,
    cancel: &CancelToken,
) -> Result<Vec<f64>> {
    cancel.check()?;
    let mut dist = vec![f64::INFINITY; links.len()];
    let mut heap = BinaryHeap::new();
    dist[source] = 0.0;
    heap.push(Reverse((OrderedFloat(0.0), source)));

    while let Some(Reverse((OrderedFloat(cost), node))) = heap.pop() {
        if cost > dist[node] {
            continue;
        }
        for &(next, time) in &links[node] {
            if Some(next) == removed {
                continue;
            }
            let candidate = cost + time;
            if candidate < dist[next] {
                dist[next] = candidate;
                heap.push(Reverse((OrderedFloat(candidate), next)));
            }
        }
    }
    Ok(dist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphFilter;
    use crate::model::{Edge, Mode, Node, YearSnapshot};
    use crate::Error;

    fn build(ids: &[&str], edges: Vec<Edge>) -> MultiplexGraph {
        let nodes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| Node::new(*id, NodeKind::BusStop, 12.9 + i as f64 * 0.01, 77.6, 2014))
            .collect();
        let snapshot = YearSnapshot::new(2020, nodes, edges, vec![]).unwrap();
        MultiplexGraph::build(&snapshot, GraphFilter::ALL, 2.0, &CancelToken::new()).unwrap()
    }

    fn linear() -> MultiplexGraph {
        let ids = ["A", "B", "C", "D", "E"];
        let edges = ids
            .windows(2)
            .map(|p| Edge::new(p[0], p[1], Mode::BusRoute, 5.0))
            .collect();
        build(&ids, edges)
    }

    #[test]
    fn test_center_of_line_is_most_critical() {
        let analyzer = CriticalNodeAnalyzer::new(CriticalityConfig::default());
        let scores = analyzer.rank(&linear(), 5, &CancelToken::new()).unwrap();
        let order: Vec<&str> = scores.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(order, vec!["C", "B", "D", "A", "E"]);

        // {A, B} x {D, E} in both directions
        assert_eq!(scores[0].disconnected_pairs, 8);
        assert_eq!(scores[1].disconnected_pairs, 6);
        assert_eq!(scores[3].loss, 0.0);
        assert_eq!(scores[0].rank, 1);
        assert!(scores.iter().all(|s| !s.approximate));
    }

    #[test]
    fn test_isolated_node_never_outranks_a_cut_vertex() {
        let graph = build(
            &["a", "hub", "x", "y"],
            vec![
                Edge::new("x", "hub", Mode::BusRoute, 1.0),
                Edge::new("hub", "y", Mode::BusRoute, 1.0),
            ],
        );
        let analyzer = CriticalNodeAnalyzer::new(CriticalityConfig::default());
        let scores = analyzer.rank(&graph, 4, &CancelToken::new()).unwrap();
        assert_eq!(scores[0].node_id, "hub");
        assert_eq!(scores[0].disconnected_pairs, 2);
        let isolated = scores.iter().find(|s| s.node_id == "a").unwrap();
        assert_eq!(isolated.loss, 0.0);
    }

    #[test]
    fn test_detour_counts_as_degraded() {
        // Removing m leaves s -> t reachable only through the long way round.
        let graph = build(
            &["long", "m", "s", "t"],
            vec![
                Edge::new("s", "m", Mode::BusRoute, 1.0),
                Edge::new("m", "t", Mode::BusRoute, 1.0),
                Edge::new("s", "long", Mode::BusRoute, 5.0),
                Edge::new("long", "t", Mode::BusRoute, 5.0),
            ],
        );
        let analyzer = CriticalNodeAnalyzer::new(CriticalityConfig::default());
        let scores = analyzer.rank(&graph, 1, &CancelToken::new()).unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].node_id, "m");
        assert_eq!(scores[0].disconnected_pairs, 0);
        // only s<->t gets worse, every pair through `long` keeps its cost
        assert_eq!(scores[0].degraded_pairs, 2);
    }

    #[test]
    fn test_sampled_estimate_is_flagged_and_deterministic() {
        let ids: Vec<String> = (0..12).map(|i| format!("n{:02}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let edges = id_refs
            .windows(2)
            .map(|p| Edge::new(p[0], p[1], Mode::BusRoute, 1.0))
            .collect();
        let graph = build(&id_refs, edges);

        let config = CriticalityConfig {
            exact_node_limit: 5,
            sample_sources: 4,
            ..CriticalityConfig::default()
        };
        let analyzer = CriticalNodeAnalyzer::new(config);
        let first = analyzer.rank(&graph, 12, &CancelToken::new()).unwrap();
        let second = analyzer.rank(&graph, 12, &CancelToken::new()).unwrap();
        assert_eq!(first, second);
        assert!(first.iter().all(|s| s.approximate));
        assert_eq!(first.len(), 12);
    }

    #[test]
    fn test_cancelled_ranking() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let analyzer = CriticalNodeAnalyzer::new(CriticalityConfig::default());
        assert!(matches!(analyzer.rank(&linear(), 3, &cancel), Err(Error::Cancelled)));
    }
}
