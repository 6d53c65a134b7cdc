//! Heuristic network growth projection.
//!
//! Yearly node additions per kind are fitted with a least-squares line and
//! extrapolated; projected nodes are placed around k-means centroids of the
//! historical additions. Every projected entity carries `projected: true`
//! and nothing here is ever written back into a [`YearSnapshot`].

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use geo::{Distance, Haversine, Point};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::ForecastConfig;
use crate::model::{Mode, NodeId, NodeKind, YearSnapshot};
use crate::{Error, Result};

/// Fallback spread, in degrees, for clusters whose members coincide.
const MIN_SPREAD_DEG: f64 = 0.002;
const KMEANS_ITERATIONS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub lat: f64,
    pub lon: f64,
    /// Year the node is expected to appear.
    pub year: i32,
    pub cluster: usize,
    pub projected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub mode: Mode,
    pub base_travel_time: f64,
    pub projected: bool,
}

/// A station under construction expected to open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedTransition {
    pub node_id: NodeId,
    pub from: NodeKind,
    pub to: NodeKind,
    pub expected_year: i32,
    pub projected: bool,
}

/// Fitted additions-per-year line for one node kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthTrend {
    pub kind: NodeKind,
    /// `(year, nodes added that year)` for every observed transition.
    pub observed: Vec<(i32, usize)>,
    pub slope: f64,
    pub intercept: f64,
    pub projected_additions: usize,
}

impl GrowthTrend {
    pub fn predict(&self, year: i32) -> usize {
        let value = self.intercept + self.slope * f64::from(year);
        if value.is_finite() && value > 0.0 {
            value.round() as usize
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub base_year: i32,
    pub target_year: i32,
    pub nodes: Vec<ProjectedNode>,
    pub edges: Vec<ProjectedEdge>,
    pub transitions: Vec<ProjectedTransition>,
    pub growth: Vec<GrowthTrend>,
}

pub struct ForecastProjector {
    config: ForecastConfig,
}

impl ForecastProjector {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    /// Projects additions for every year after the last snapshot up to
    /// `target_year`, at most `max_horizon_years` ahead. Snapshots must be in
    /// strictly ascending year order.
    pub fn project(
        &self,
        snapshots: &[Arc<YearSnapshot>],
        target_year: i32,
        cancel: &CancelToken,
    ) -> Result<Forecast> {
        let Some(last) = snapshots.last() else {
            return Err(Error::DataInconsistency("no snapshots to project from".into()));
        };
        if snapshots.windows(2).any(|w| w[0].year() >= w[1].year()) {
            return Err(Error::DataInconsistency(
                "snapshots must be in strictly ascending year order".into(),
            ));
        }
        let base_year = last.year();
        let horizon = base_year.saturating_add(self.config.max_horizon_years);
        if target_year <= base_year || target_year > horizon {
            return Err(Error::OutOfRangeYear {
                year: target_year,
                min: base_year + 1,
                max: horizon,
            });
        }

        let additions = observed_additions(snapshots);
        let mut growth = Vec::new();
        let mut nodes = Vec::new();

        for (kind_idx, kind) in NodeKind::ALL.iter().copied().enumerate() {
            cancel.check()?;
            let per_year: Vec<(i32, usize)> = snapshots[1..]
                .iter()
                .map(|s| {
                    let count = additions
                        .iter()
                        .filter(|a| a.year == s.year() && a.kind == kind)
                        .count();
                    (s.year(), count)
                })
                .collect();
            let (slope, intercept) = fit_line(&per_year);
            let mut trend = GrowthTrend {
                kind,
                observed: per_year,
                slope,
                intercept,
                projected_additions: 0,
            };

            let mut yearly: Vec<(i32, usize)> = Vec::with_capacity((target_year - base_year) as usize);
            for year in base_year + 1..=target_year {
                cancel.check()?;
                yearly.push((year, trend.predict(year)));
            }
            trend.projected_additions = yearly.iter().map(|(_, n)| n).sum();

            if trend.projected_additions > 0 {
                let mut history: Vec<(f64, f64)> = additions
                    .iter()
                    .filter(|a| a.kind == kind)
                    .map(|a| (a.lat, a.lon))
                    .collect();
                if history.is_empty() {
                    history = last
                        .nodes()
                        .iter()
                        .filter(|n| n.kind == kind)
                        .map(|n| (n.lat, n.lon))
                        .collect();
                }
                let seed = self.config.seed.wrapping_add(kind_idx as u64);
                nodes.extend(self.place(kind, &history, &yearly, seed, cancel)?);
            }
            growth.push(trend);
        }

        let edges = self.link_to_network(&nodes, last, cancel)?;
        let transitions = self.project_openings(snapshots, target_year);
        debug!(
            "Projected {} nodes, {} edges and {} openings for {}",
            nodes.len(),
            edges.len(),
            transitions.len(),
            target_year
        );

        Ok(Forecast {
            base_year,
            target_year,
            nodes,
            edges,
            transitions,
            growth,
        })
    }

    fn place(
        &self,
        kind: NodeKind,
        history: &[(f64, f64)],
        yearly: &[(i32, usize)],
        seed: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<ProjectedNode>> {
        if history.is_empty() {
            return Ok(Vec::new());
        }
        let total: usize = yearly.iter().map(|(_, n)| n).sum();
        let clusters = kmeans(history, self.config.cluster_count.min(history.len()));
        let quotas = apportion(&clusters.iter().map(|c| c.members).collect::<Vec<_>>(), total);

        let mut slots: Vec<usize> = Vec::with_capacity(total);
        for (cluster, quota) in quotas.iter().enumerate() {
            slots.extend(std::iter::repeat(cluster).take(*quota));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut placed = Vec::with_capacity(total);
        let mut slot_iter = slots.into_iter();
        for &(year, count) in yearly {
            cancel.check()?;
            for seq in 0..count {
                let Some(cluster) = slot_iter.next() else {
                    break;
                };
                let c = &clusters[cluster];
                let spread = c.spread.max(MIN_SPREAD_DEG);
                let lat = (c.lat + rng.random_range(-spread..=spread)).clamp(-90.0, 90.0);
                let lon = (c.lon + rng.random_range(-spread..=spread)).clamp(-180.0, 180.0);
                placed.push(ProjectedNode {
                    id: format!("projected-{}-{}-{}", year, kind.as_str(), seq),
                    kind,
                    lat,
                    lon,
                    year,
                    cluster,
                    projected: true,
                });
            }
        }
        Ok(placed)
    }

    /// One edge per projected node to the nearest existing node of its layer.
    fn link_to_network(
        &self,
        nodes: &[ProjectedNode],
        last: &YearSnapshot,
        cancel: &CancelToken,
    ) -> Result<Vec<ProjectedEdge>> {
        let mut edges = Vec::with_capacity(nodes.len());
        for (i, projected) in nodes.iter().enumerate() {
            if i % 256 == 0 {
                cancel.check()?;
            }
            let layer = projected.kind.layer();
            let origin = Point::new(projected.lon, projected.lat);
            let nearest = last
                .nodes()
                .iter()
                .filter(|n| n.kind.layer() == layer)
                .map(|n| (n, Haversine.distance(origin, n.point())))
                .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
            if let Some((node, meters)) = nearest {
                let speed_kmh = match layer {
                    Mode::MetroLine => self.config.metro_speed_kmh,
                    Mode::BusRoute => self.config.bus_speed_kmh,
                    Mode::RoadSegment => self.config.road_speed_kmh,
                };
                edges.push(ProjectedEdge {
                    from: projected.id.clone(),
                    to: node.id.clone(),
                    mode: layer,
                    base_travel_time: meters / 1000.0 / speed_kmh * 60.0,
                    projected: true,
                });
            }
        }
        Ok(edges)
    }

    /// Openings of stations still under construction in the last snapshot,
    /// using the mean observed construction duration.
    fn project_openings(&self, snapshots: &[Arc<YearSnapshot>], target_year: i32) -> Vec<ProjectedTransition> {
        let mut construction_started: AHashMap<&str, i32> = AHashMap::new();
        let mut durations = Vec::new();
        let mut opened: AHashSet<&str> = AHashSet::new();

        for snapshot in snapshots {
            for node in snapshot.nodes() {
                match node.kind {
                    NodeKind::MetroUnderConstruction => {
                        construction_started.entry(node.id.as_str()).or_insert(snapshot.year());
                    }
                    NodeKind::MetroStation => {
                        if let Some(&start) = construction_started.get(node.id.as_str()) {
                            if opened.insert(node.id.as_str()) {
                                durations.push(snapshot.year() - start);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let duration = if durations.is_empty() {
            self.config.default_construction_years
        } else {
            let mean = f64::from(durations.iter().sum::<i32>()) / durations.len() as f64;
            (mean.round() as i32).max(1)
        };

        let Some(last) = snapshots.last() else {
            return Vec::new();
        };
        let mut transitions: Vec<ProjectedTransition> = last
            .nodes()
            .iter()
            .filter(|n| n.kind == NodeKind::MetroUnderConstruction)
            .filter_map(|n| {
                let start = construction_started
                    .get(n.id.as_str())
                    .copied()
                    .unwrap_or(n.first_seen);
                let expected_year = (start + duration).max(last.year() + 1);
                (expected_year <= target_year).then(|| ProjectedTransition {
                    node_id: n.id.clone(),
                    from: NodeKind::MetroUnderConstruction,
                    to: NodeKind::MetroStation,
                    expected_year,
                    projected: true,
                })
            })
            .collect();
        transitions.sort_by(|a, b| a.expected_year.cmp(&b.expected_year).then_with(|| a.node_id.cmp(&b.node_id)));
        transitions
    }
}

struct Addition {
    year: i32,
    kind: NodeKind,
    lat: f64,
    lon: f64,
}

/// Nodes that first appear in each snapshot after the first one.
fn observed_additions(snapshots: &[Arc<YearSnapshot>]) -> Vec<Addition> {
    snapshots
        .windows(2)
        .flat_map(|pair| {
            let (previous, current) = (&pair[0], &pair[1]);
            current
                .nodes()
                .iter()
                .filter(|n| !previous.contains(&n.id))
                .map(|n| Addition {
                    year: current.year(),
                    kind: n.kind,
                    lat: n.lat,
                    lon: n.lon,
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Least-squares `(slope, intercept)`; a single point gives a flat line.
fn fit_line(points: &[(i32, usize)]) -> (f64, f64) {
    match points.len() {
        0 => (0.0, 0.0),
        1 => (0.0, points[0].1 as f64),
        len => {
            let n = len as f64;
            let mean_x = points.iter().map(|(x, _)| f64::from(*x)).sum::<f64>() / n;
            let mean_y = points.iter().map(|(_, y)| *y as f64).sum::<f64>() / n;
            let mut sxy = 0.0;
            let mut sxx = 0.0;
            for (x, y) in points {
                let dx = f64::from(*x) - mean_x;
                sxy += dx * (*y as f64 - mean_y);
                sxx += dx * dx;
            }
            let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
            (slope, mean_y - slope * mean_x)
        }
    }
}

struct Cluster {
    lat: f64,
    lon: f64,
    members: usize,
    /// Mean member distance to the centroid, in degrees.
    spread: f64,
}

/// Lloyd's k-means over `(lat, lon)` with evenly spaced initial centroids
/// taken from the sorted points.
fn kmeans(points: &[(f64, f64)], k: usize) -> Vec<Cluster> {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.total_cmp(&b.1)));
    let k = k.max(1).min(sorted.len());
    let mut centroids: Vec<(f64, f64)> = (0..k).map(|i| sorted[i * sorted.len() / k]).collect();
    let mut assignment = vec![0usize; sorted.len()];

    for _ in 0..KMEANS_ITERATIONS {
        let mut changed = false;
        for (i, p) in sorted.iter().enumerate() {
            let nearest = nearest_centroid(&centroids, *p);
            if assignment[i] != nearest {
                assignment[i] = nearest;
                changed = true;
            }
        }

        let mut sums = vec![(0.0, 0.0, 0usize); k];
        for (p, &c) in sorted.iter().zip(&assignment) {
            sums[c].0 += p.0;
            sums[c].1 += p.1;
            sums[c].2 += 1;
        }
        for (centroid, (lat, lon, count)) in centroids.iter_mut().zip(sums) {
            if count > 0 {
                *centroid = (lat / count as f64, lon / count as f64);
            }
        }
        if !changed {
            break;
        }
    }

    centroids
        .iter()
        .enumerate()
        .map(|(c, &(lat, lon))| {
            let members: Vec<&(f64, f64)> = sorted
                .iter()
                .zip(&assignment)
                .filter(|(_, &a)| a == c)
                .map(|(p, _)| p)
                .collect();
            let spread = if members.is_empty() {
                0.0
            } else {
                members
                    .iter()
                    .map(|p| ((p.0 - lat).powi(2) + (p.1 - lon).powi(2)).sqrt())
                    .sum::<f64>()
                    / members.len() as f64
            };
            Cluster {
                lat,
                lon,
                members: members.len(),
                spread,
            }
        })
        .collect()
}

fn nearest_centroid(centroids: &[(f64, f64)], p: (f64, f64)) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = (c.0 - p.0).powi(2) + (c.1 - p.1).powi(2);
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}

/// Splits `total` over `weights` by largest remainder. Earlier entries win ties.
fn apportion(weights: &[usize], total: usize) -> Vec<usize> {
    let sum: usize = weights.iter().sum();
    if sum == 0 {
        return vec![0; weights.len()];
    }
    let mut quotas: Vec<usize> = weights.iter().map(|w| w * total / sum).collect();
    let mut remainders: Vec<(usize, usize)> = weights
        .iter()
        .enumerate()
        .map(|(i, w)| ((w * total) % sum, i))
        .collect();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let missing = total - quotas.iter().sum::<usize>();
    for &(_, i) in remainders.iter().take(missing) {
        quotas[i] += 1;
    }
    quotas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;

    fn bus(id: &str, lat: f64, lon: f64, first_seen: i32) -> Node {
        Node::new(id, NodeKind::BusStop, lat, lon, first_seen)
    }

    fn history() -> Vec<Arc<YearSnapshot>> {
        let mut nodes = vec![
            bus("b0", 12.90, 77.50, 2014),
            Node::new("m0", NodeKind::MetroStation, 12.97, 77.59, 2014),
            Node::new("m1", NodeKind::MetroUnderConstruction, 12.98, 77.60, 2014),
        ];
        let mut snapshots = vec![Arc::new(YearSnapshot::new(2014, nodes.clone(), vec![], vec![]).unwrap())];

        // Two bus stops a year, split between two neighbourhoods.
        for (step, year) in (2015..=2017).enumerate() {
            nodes.push(bus(&format!("w{}", step), 12.90 + step as f64 * 0.001, 77.50, year));
            nodes.push(bus(&format!("e{}", step), 13.05, 77.70 + step as f64 * 0.001, year));
            if year == 2017 {
                for node in nodes.iter_mut().filter(|n| n.id == "m1") {
                    node.kind = NodeKind::MetroStation;
                }
                nodes.push(Node::new("m2", NodeKind::MetroUnderConstruction, 12.99, 77.61, year));
            }
            snapshots.push(Arc::new(YearSnapshot::new(year, nodes.clone(), vec![], vec![]).unwrap()));
        }
        snapshots
    }

    #[test]
    fn test_projects_linear_growth_near_history() {
        let projector = ForecastProjector::new(ForecastConfig::default());
        let forecast = projector.project(&history(), 2019, &CancelToken::new()).unwrap();

        let bus_trend = forecast.growth.iter().find(|g| g.kind == NodeKind::BusStop).unwrap();
        assert_eq!(bus_trend.observed, vec![(2015, 2), (2016, 2), (2017, 2)]);
        assert_eq!(bus_trend.projected_additions, 4);

        let buses: Vec<&ProjectedNode> = forecast.nodes.iter().filter(|n| n.kind == NodeKind::BusStop).collect();
        assert_eq!(buses.len(), 4);
        assert!(forecast.nodes.iter().all(|n| n.projected));
        for node in &buses {
            let near_west = (node.lat - 12.90).abs() < 0.02 && (node.lon - 77.50).abs() < 0.02;
            let near_east = (node.lat - 13.05).abs() < 0.02 && (node.lon - 77.70).abs() < 0.02;
            assert!(near_west || near_east, "{:?}", node);
        }
        assert_eq!(buses.iter().filter(|n| n.year == 2018).count(), 2);
    }

    #[test]
    fn test_projected_edges_use_layer_speed() {
        let projector = ForecastProjector::new(ForecastConfig::default());
        let forecast = projector.project(&history(), 2018, &CancelToken::new()).unwrap();
        assert_eq!(forecast.edges.len(), forecast.nodes.len());
        for edge in &forecast.edges {
            assert!(edge.projected);
            assert!(edge.base_travel_time >= 0.0);
            let node = forecast.nodes.iter().find(|n| n.id == edge.from).unwrap();
            assert_eq!(edge.mode, node.kind.layer());
        }
    }

    #[test]
    fn test_construction_openings_use_observed_duration() {
        let projector = ForecastProjector::new(ForecastConfig::default());
        // m1: construction seen 2014, open 2017 => 3 years. m2 starts 2017.
        let early = projector.project(&history(), 2019, &CancelToken::new()).unwrap();
        assert!(early.transitions.is_empty());

        let later = projector.project(&history(), 2021, &CancelToken::new()).unwrap();
        assert_eq!(later.transitions.len(), 1);
        assert_eq!(later.transitions[0].node_id, "m2");
        assert_eq!(later.transitions[0].expected_year, 2020);
        assert!(later.transitions[0].projected);
    }

    #[test]
    fn test_projection_is_deterministic() {
        let projector = ForecastProjector::new(ForecastConfig::default());
        assert_eq!(
            projector.project(&history(), 2020, &CancelToken::new()).unwrap(),
            projector.project(&history(), 2020, &CancelToken::new()).unwrap()
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        let projector = ForecastProjector::new(ForecastConfig::default());
        let snapshots = history();
        assert!(matches!(
            projector.project(&snapshots, 2017, &CancelToken::new()),
            Err(Error::OutOfRangeYear { .. })
        ));
        assert!(matches!(projector.project(&[], 2020, &CancelToken::new()), Err(Error::DataInconsistency(_))));

        let reversed: Vec<_> = snapshots.iter().rev().cloned().collect();
        assert!(matches!(
            projector.project(&reversed, 2020, &CancelToken::new()),
            Err(Error::DataInconsistency(_))
        ));
    }

    #[test]
    fn test_target_beyond_horizon_is_rejected() {
        let projector = ForecastProjector::new(ForecastConfig::default());
        let snapshots = history();
        assert!(projector.project(&snapshots, 2047, &CancelToken::new()).is_ok());
        assert!(matches!(
            projector.project(&snapshots, 20000, &CancelToken::new()),
            Err(Error::OutOfRangeYear { year: 20000, min: 2018, max: 2047 })
        ));
        assert!(matches!(
            projector.project(&snapshots, i32::MAX, &CancelToken::new()),
            Err(Error::OutOfRangeYear { .. })
        ));
    }

    #[test]
    fn test_cancelled_projection() {
        let projector = ForecastProjector::new(ForecastConfig::default());
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            projector.project(&history(), 2030, &token),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_apportion_and_fit() {
        assert_eq!(apportion(&[3, 1], 4), vec![3, 1]);
        assert_eq!(apportion(&[1, 1, 1], 2), vec![1, 1, 0]);
        let (slope, intercept) = fit_line(&[(2015, 1), (2016, 3), (2017, 5)]);
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((intercept + slope * 2018.0 - 7.0).abs() < 1e-6);
    }
}
