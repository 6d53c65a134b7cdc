use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::alerts::{detect_alerts, Alert};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::congestion::{CongestionModel, CongestionSample, CongestionStore, Hotspot};
use crate::criticality::{CriticalNodeAnalyzer, CriticalityScore};
use crate::forecast::{Forecast, ForecastProjector};
use crate::graph::{GraphBuilder, GraphFilter, GraphHandle};
use crate::model::YearSnapshot;
use crate::router::{RouteCandidate, Router};
use crate::store::GeoEntityStore;
use crate::{Error, Result};

/// A route search request. Endpoints may be node ids or stop names.
#[derive(Debug, Clone)]
pub struct RouteQuery {
    pub year: i32,
    pub filter: GraphFilter,
    pub source: String,
    pub destination: String,
    pub max_results: usize,
    pub at: DateTime<Utc>,
}

impl RouteQuery {
    pub fn new(year: i32, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            year,
            filter: GraphFilter::ALL,
            source: source.into(),
            destination: destination.into(),
            max_results: 1,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: GraphFilter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    #[must_use]
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// Route candidates together with the graph they were found on.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub graph: GraphHandle,
    pub candidates: Vec<RouteCandidate>,
}

/// Entry point wiring the store, the congestion model and the three query
/// consumers together.
pub struct TransitEngine {
    config: EngineConfig,
    store: Arc<GeoEntityStore>,
    congestion: CongestionModel,
    builder: GraphBuilder,
    analyzer: CriticalNodeAnalyzer,
    projector: ForecastProjector,
}

impl TransitEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(GeoEntityStore::new(config.year_range));
        let congestion = CongestionModel::new(Arc::new(CongestionStore::new()), config.congestion.clone());
        let builder = GraphBuilder::new(store.clone(), config.graph_cache_capacity, config.default_hop_minutes);
        let analyzer = CriticalNodeAnalyzer::new(config.criticality.clone());
        let projector = ForecastProjector::new(config.forecast.clone());
        Ok(Self {
            config,
            store,
            congestion,
            builder,
            analyzer,
            projector,
        })
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn store(&self) -> &Arc<GeoEntityStore> {
        &self.store
    }

    #[inline]
    pub fn congestion(&self) -> &CongestionModel {
        &self.congestion
    }

    #[inline]
    pub fn graph_builder(&self) -> &GraphBuilder {
        &self.builder
    }

    pub fn insert_snapshot(&self, snapshot: YearSnapshot) -> Result<Arc<YearSnapshot>> {
        self.store.insert(snapshot)
    }

    /// Snapshot serving `year`, or the latest one when `year` is `None`.
    pub fn snapshot(&self, year: Option<i32>) -> Result<Arc<YearSnapshot>> {
        match year {
            Some(year) => self.store.snapshot_for(year),
            None => self
                .store
                .latest()
                .ok_or_else(|| Error::DataInconsistency("no snapshot has been loaded".into())),
        }
    }

    pub fn latest_year(&self) -> Option<i32> {
        self.store.latest().map(|s| s.year())
    }

    pub fn build_graph(&self, year: i32, filter: GraphFilter) -> Result<GraphHandle> {
        self.builder.build(year, filter)
    }

    pub fn build_graph_with_cancel(&self, year: i32, filter: GraphFilter, cancel: &CancelToken) -> Result<GraphHandle> {
        self.builder.build_with_cancel(year, filter, cancel)
    }

    /// Resolves the endpoints by id or stop name and searches once.
    pub fn find_routes(&self, query: &RouteQuery, cancel: &CancelToken) -> Result<RoutePlan> {
        let started = Instant::now();
        let graph = self.builder.build_with_cancel(query.year, query.filter, cancel)?;
        let source = self.endpoint_id(&graph, &query.source, "source")?;
        let destination = self.endpoint_id(&graph, &query.destination, "destination")?;

        let router = Router::new(&graph, &self.congestion, query.at);
        let candidates = router.find_routes(&source, &destination, query.max_results, cancel)?;
        debug!(
            "{} -> {} in {}: {} candidates in {:?}",
            source,
            destination,
            query.year,
            candidates.len(),
            started.elapsed()
        );
        Ok(RoutePlan { graph, candidates })
    }

    fn endpoint_id(&self, graph: &GraphHandle, id_or_name: &str, role: &str) -> Result<String> {
        graph
            .resolve(id_or_name)
            .map(|idx| graph.node(idx).id.clone())
            .ok_or_else(|| {
                Error::InvalidEndpoints(format!(
                    "{} {} is not in the {} graph",
                    role,
                    id_or_name,
                    graph.snapshot_year()
                ))
            })
    }

    pub fn rank_criticality(
        &self,
        year: i32,
        filter: GraphFilter,
        top_k: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<CriticalityScore>> {
        let graph = self.builder.build_with_cancel(year, filter, cancel)?;
        self.analyzer.rank(&graph, top_k, cancel)
    }

    /// Projects from every stored snapshot.
    pub fn project_future(&self, target_year: i32, cancel: &CancelToken) -> Result<Forecast> {
        self.projector.project(&self.store.all(), target_year, cancel)
    }

    /// Stop names of the snapshot serving `year` (latest when `None`).
    pub fn stop_names(&self, year: Option<i32>) -> Result<Vec<String>> {
        Ok(self.snapshot(year)?.stop_names())
    }

    /// Id of the latest snapshot's node nearest to `(lat, lon)`, used as the
    /// segment id of coordinate-tagged samples.
    pub fn snap_to_segment(&self, lat: f64, lon: f64) -> Result<String> {
        if !(lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)) {
            return Err(Error::DataInconsistency(format!("invalid coordinate ({}, {})", lat, lon)));
        }
        let snapshot = self.snapshot(None)?;
        let (node, meters) = snapshot
            .nearest_node(lat, lon)
            .ok_or_else(|| Error::DataInconsistency(format!("snapshot {} has no nodes", snapshot.year())))?;
        let limit = self.config.congestion.max_snap_meters;
        if meters > limit {
            return Err(Error::DataInconsistency(format!(
                "({}, {}) is {:.0} m from the nearest node, limit is {:.0} m",
                lat, lon, meters, limit
            )));
        }
        debug!("Snapped ({}, {}) to {} at {:.1} m", lat, lon, node.id, meters);
        Ok(node.id.clone())
    }

    pub fn ingest(&self, sample: CongestionSample) {
        self.congestion.store().append(sample);
    }

    pub fn ingest_batch(&self, samples: Vec<CongestionSample>) -> usize {
        let count = self.congestion.store().append_batch(samples);
        info!(
            "Ingested {} congestion samples ({} total over {} segments)",
            count,
            self.congestion.store().sample_count(),
            self.congestion.store().segment_count()
        );
        count
    }

    pub fn alerts(&self, at: DateTime<Utc>) -> Vec<Alert> {
        let latest = self
            .congestion
            .store()
            .latest_samples(at, self.congestion.freshness_window());
        detect_alerts(&latest, &self.config.alerts)
    }

    pub fn hotspots(&self, limit: usize) -> Vec<Hotspot> {
        self.congestion.store().hotspots(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::congestion::PenaltyCurve;
    use crate::model::{Mode, Node, NodeKind, Trip};

    fn engine() -> TransitEngine {
        let mut config = EngineConfig::default();
        config.congestion.penalty = PenaltyCurve::Threshold {
            threshold: 70.0,
            multiplier: 1.0,
        };
        let engine = TransitEngine::new(config).unwrap();
        let nodes = vec![
            Node::new("s1", NodeKind::BusStop, 12.97, 77.57, 2014).with_name("Majestic"),
            Node::new("s2", NodeKind::BusStop, 12.96, 77.58, 2014).with_name("Town Hall"),
            Node::new("s3", NodeKind::BusStop, 12.95, 77.59, 2014).with_name("Lalbagh"),
        ];
        let trips = vec![Trip::new("t1", "500D", Mode::BusRoute, vec!["s1".into(), "s2".into(), "s3".into()])
            .with_hop_times(vec![4.0, 6.0])];
        engine
            .insert_snapshot(YearSnapshot::new(2016, nodes, vec![], trips).unwrap())
            .unwrap();
        engine
    }

    #[test]
    fn test_find_routes_by_stop_name() {
        let engine = engine();
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();
        engine.ingest_batch(vec![CongestionSample::new("s3", at, 95.0).unwrap()]);

        let query = RouteQuery::new(2020, "majestic", "LALBAGH").at(at);
        let plan = engine.find_routes(&query, &CancelToken::new()).unwrap();
        let best = &plan.candidates[0];
        assert_eq!(best.nodes, vec!["s1", "s2", "s3"]);
        assert_eq!(best.base_travel_time, 10.0);
        assert_eq!(best.delay, 6.0);
        assert_eq!(plan.graph.snapshot_year(), 2016);
        assert_eq!(best.primary_route_ref(), Some("t1"));
    }

    #[test]
    fn test_unknown_stop_is_invalid_endpoint() {
        let engine = engine();
        let query = RouteQuery::new(2016, "Majestic", "Silk Board");
        assert!(matches!(
            engine.find_routes(&query, &CancelToken::new()),
            Err(Error::InvalidEndpoints(_))
        ));
    }

    #[test]
    fn test_stop_names_and_alerts() {
        let engine = engine();
        assert_eq!(engine.stop_names(None).unwrap(), vec!["Lalbagh", "Majestic", "Town Hall"]);
        assert!(engine.stop_names(Some(2015)).is_err());

        let at = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();
        engine.ingest(CongestionSample::new("s2", at, 90.0).unwrap());
        let alerts = engine.alerts(at);
        assert_eq!(alerts.len(), 1);
        assert_eq!(engine.hotspots(5)[0].segment_id, "s2");
    }

    #[test]
    fn test_snap_to_segment() {
        let engine = engine();
        assert_eq!(engine.snap_to_segment(12.9601, 77.5802).unwrap(), "s2");
        assert!(matches!(
            engine.snap_to_segment(13.20, 77.58),
            Err(Error::DataInconsistency(_))
        ));
        assert!(engine.snap_to_segment(f64::NAN, 77.58).is_err());

        let empty = TransitEngine::new(EngineConfig::default()).unwrap();
        assert!(matches!(
            empty.snap_to_segment(12.96, 77.58),
            Err(Error::DataInconsistency(_))
        ));
    }
}
