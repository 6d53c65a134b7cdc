//! # transitx Core
//!
//! Temporal multiplex transit graph engine.
//!
//! - [`GeoEntityStore`] - immutable per-year snapshots of stops, stations and trips
//! - [`CongestionModel`] - effective congestion per segment and the derived delay
//! - [`GraphBuilder`] - filtered multiplex graphs per year, cached by `(snapshot year, filter)`
//! - [`Router`] - congestion-weighted shortest and k-shortest paths
//! - [`CriticalNodeAnalyzer`] - node-removal connectivity loss ranking
//! - [`ForecastProjector`] - heuristic growth projection
//! - [`TransitEngine`] - all of the above behind one facade
//!
//! ## Example
//!
//! ```rust
//! use transitx_core::{CancelToken, EngineConfig, Mode, Node, NodeKind, RouteQuery, TransitEngine, Trip, YearSnapshot};
//!
//! let engine = TransitEngine::new(EngineConfig::default()).unwrap();
//! let nodes = vec![
//!     Node::new("a", NodeKind::BusStop, 12.97, 77.59, 2014),
//!     Node::new("b", NodeKind::BusStop, 12.98, 77.60, 2014),
//! ];
//! let trips = vec![Trip::new("t1", "500D", Mode::BusRoute, vec!["a".into(), "b".into()])];
//! engine.insert_snapshot(YearSnapshot::new(2020, nodes, vec![], trips).unwrap()).unwrap();
//!
//! let plan = engine.find_routes(&RouteQuery::new(2020, "a", "b"), &CancelToken::new()).unwrap();
//! assert_eq!(plan.candidates[0].nodes, vec!["a", "b"]);
//! ```

pub mod alerts;
pub mod cancel;
pub mod config;
pub mod congestion;
pub mod criticality;
pub mod engine;
pub mod error;
pub mod forecast;
pub mod graph;
pub mod model;
pub mod router;
pub mod store;

pub use alerts::{detect_alerts, Alert, AlertType};
pub use cancel::CancelToken;
pub use config::{AlertPolicy, CongestionConfig, CriticalityConfig, EngineConfig, ForecastConfig, YearRange};
pub use congestion::{
    CongestionModel, CongestionReading, CongestionSample, CongestionSource, CongestionStore, CongestionView,
    Hotspot, PenaltyCurve,
};
pub use criticality::{CriticalNodeAnalyzer, CriticalityScore};
pub use engine::{RoutePlan, RouteQuery, TransitEngine};
pub use error::{Error, Result};
pub use forecast::{Forecast, ForecastProjector, GrowthTrend, ProjectedEdge, ProjectedNode, ProjectedTransition};
pub use graph::{GraphBuilder, GraphCache, GraphEdge, GraphFilter, GraphHandle, MultiplexGraph, NodeIdx};
pub use model::{Edge, Mode, Node, NodeId, NodeKind, Trip, YearSnapshot};
pub use router::{find_routes, RouteCandidate, RouteLeg, Router, StopCongestion};
pub use store::GeoEntityStore;
