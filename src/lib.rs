//! # transitx
//!
//! Temporal multiplex transit graph engine: yearly snapshots of a city's bus,
//! metro and road network, congestion-weighted routing, critical node
//! ranking and heuristic growth forecasts.
//!
//! ## Quick Start
//!
//! ### As a Server
//!
//! ```bash
//! transitx --data-dir ./data --http-port 5000
//! ```
//!
//! The data directory holds `snapshots/<year>.json` (or
//! `snapshots/data_<year>.geojson`), an append-only `congestion.log` and the
//! generated `artifacts/`.
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use transitx::prelude::*;
//!
//! let manager = DatasetManager::open("./data", EngineConfig::default()).unwrap();
//! let query = RouteQuery::new(2024, "Majestic", "Lalbagh").with_max_results(3);
//! let plan = manager.engine().find_routes(&query, &CancelToken::new()).unwrap();
//! for route in &plan.candidates {
//!     println!("{:?} delay {:.1} min", route.nodes, route.delay);
//! }
//! ```
//!
//! ## Crate Structure
//!
//! - `transitx-core` - snapshots, congestion, graph building, routing, criticality, forecasting
//! - `transitx-storage` - dataset directory, congestion log, GeoJSON import and artifact export
//! - `transitx-api` - REST API

// Re-export core types
pub use transitx_core::{
    Alert, CancelToken, CongestionSample, CriticalNodeAnalyzer, CriticalityScore, EngineConfig, Error,
    Forecast, ForecastProjector, GeoEntityStore, GraphBuilder, GraphFilter, Mode, MultiplexGraph, Node,
    NodeKind, PenaltyCurve, Result, RouteCandidate, RoutePlan, RouteQuery, Router, TransitEngine, Trip,
    YearSnapshot,
};

// Re-export storage
pub use transitx_storage::{ArtifactManager, DatasetManager, SnapshotRecord};

// Re-export API
pub use transitx_api::RestApi;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CancelToken, CongestionSample, DatasetManager, EngineConfig, Error, GraphFilter, Mode, Node,
        NodeKind, Result, RouteQuery, TransitEngine, Trip, YearSnapshot,
    };
}
