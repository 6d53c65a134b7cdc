// Integration tests for transitx
use actix_web::{test, web, App};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tempfile::tempdir;
use transitx::{
    CancelToken, CongestionSample, DatasetManager, EngineConfig, Error, GraphFilter, Mode, Node, NodeKind,
    PenaltyCurve, RouteQuery, SnapshotRecord, TransitEngine, Trip, YearSnapshot,
};
use transitx_core::Edge;

fn linear_record(year: i32) -> SnapshotRecord {
    let ids = ["A", "B", "C", "D", "E"];
    let nodes = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            Node::new(*id, NodeKind::BusStop, 12.90 + i as f64 * 0.01, 77.60, 2014).with_name(format!("Stop {}", id))
        })
        .collect();
    let trips = vec![Trip::new(
        "line-1",
        "Line 1",
        Mode::BusRoute,
        ids.iter().map(|s| s.to_string()).collect(),
    )
    .with_hop_times(vec![5.0; 4])];
    SnapshotRecord {
        year,
        nodes,
        edges: Vec::new(),
        trips,
    }
}

fn doubling_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.congestion.penalty = PenaltyCurve::Threshold {
        threshold: 70.0,
        multiplier: 1.0,
    };
    config
}

#[::core::prelude::v1::test]
fn test_linear_graph_free_flow() {
    let dir = tempdir().unwrap();
    let manager = DatasetManager::open(dir.path(), EngineConfig::default()).unwrap();
    manager.add_snapshot(linear_record(2018)).unwrap();
    let at = Utc.with_ymd_and_hms(2024, 5, 6, 8, 30, 0).unwrap();
    let samples = ["A", "B", "C", "D", "E"]
        .iter()
        .map(|id| CongestionSample::new(*id, at, 0.0).unwrap())
        .collect();
    assert_eq!(manager.ingest(samples).unwrap(), 5);

    let plan = manager
        .engine()
        .find_routes(&RouteQuery::new(2018, "A", "E").with_max_results(3).at(at), &CancelToken::new())
        .unwrap();
    assert_eq!(plan.candidates.len(), 1);
    let best = &plan.candidates[0];
    assert_eq!(best.total_weight, 20.0);
    assert_eq!(best.avg_congestion, Some(0.0));
    assert_eq!(best.nodes, vec!["A", "B", "C", "D", "E"]);
}

#[::core::prelude::v1::test]
fn test_congested_segment_prefers_detour() {
    let engine = TransitEngine::new(doubling_config()).unwrap();
    let mut record = linear_record(2019);
    record
        .nodes
        .push(Node::new("D2", NodeKind::RoadJunction, 12.93, 77.61, 2014));
    record.edges = vec![
        Edge::new("C", "D2", Mode::RoadSegment, 3.0).with_segment("seg-CD2"),
        Edge::new("D2", "D", Mode::RoadSegment, 3.0).with_segment("seg-D2D"),
    ];
    engine.insert_snapshot(record.into_snapshot().unwrap()).unwrap();

    let at = Utc.with_ymd_and_hms(2024, 5, 6, 8, 30, 0).unwrap();
    engine.ingest(CongestionSample::new("D", at, 90.0).unwrap());

    let query = RouteQuery::new(2019, "A", "E").with_max_results(2).at(at);
    let plan = engine.find_routes(&query, &CancelToken::new()).unwrap();
    assert_eq!(plan.candidates.len(), 2);
    assert_eq!(plan.candidates[0].nodes, vec!["A", "B", "C", "D2", "D", "E"]);
    assert!(plan.candidates[0].total_weight < plan.candidates[1].total_weight);
    assert_eq!(plan.candidates[1].nodes, vec!["A", "B", "C", "D", "E"]);
}

#[::core::prelude::v1::test]
fn test_cut_vertex_ranks_first() {
    let dir = tempdir().unwrap();
    let manager = DatasetManager::open(dir.path(), EngineConfig::default()).unwrap();
    manager.add_snapshot(linear_record(2020)).unwrap();

    let scores = manager
        .engine()
        .rank_criticality(2020, GraphFilter::ALL, 5, &CancelToken::new())
        .unwrap();
    assert_eq!(scores[0].node_id, "C");
    let rank_of = |id: &str| scores.iter().find(|s| s.node_id == id).unwrap().rank;
    assert!(rank_of("C") < rank_of("B"));
    assert!(rank_of("C") < rank_of("D"));
}

#[::core::prelude::v1::test]
fn test_year_outside_range_is_rejected() {
    let engine = TransitEngine::new(EngineConfig::default()).unwrap();
    engine.insert_snapshot(linear_record(2016).into_snapshot().unwrap()).unwrap();

    assert!(matches!(
        engine.build_graph(2013, GraphFilter::ALL),
        Err(Error::OutOfRangeYear { year: 2013, .. })
    ));
    assert!(matches!(
        engine.build_graph(2026, GraphFilter::ALL),
        Err(Error::OutOfRangeYear { year: 2026, .. })
    ));
}

#[::core::prelude::v1::test]
fn test_unknown_destination_is_invalid_endpoint() {
    let engine = TransitEngine::new(EngineConfig::default()).unwrap();
    engine.insert_snapshot(linear_record(2016).into_snapshot().unwrap()).unwrap();

    let result = engine.find_routes(&RouteQuery::new(2016, "A", "Z"), &CancelToken::new());
    assert!(matches!(result, Err(Error::InvalidEndpoints(_))));
}

#[::core::prelude::v1::test]
fn test_logged_congestion_survives_reopen() {
    let dir = tempdir().unwrap();
    let at = Utc.with_ymd_and_hms(2024, 5, 6, 8, 30, 0).unwrap();
    {
        let manager = DatasetManager::open(dir.path(), doubling_config()).unwrap();
        manager.add_snapshot(linear_record(2018)).unwrap();
        manager
            .ingest(vec![
                CongestionSample::new("C", at, 80.0).unwrap(),
                CongestionSample::from_speeds("E", at, 4.0, 40.0).unwrap(),
            ])
            .unwrap();
    }

    let manager = DatasetManager::open(dir.path(), doubling_config()).unwrap();
    let plan = manager
        .engine()
        .find_routes(&RouteQuery::new(2018, "A", "E").at(at), &CancelToken::new())
        .unwrap();
    let best = &plan.candidates[0];
    assert_eq!(best.delay, 10.0);
    assert_eq!(best.total_weight, 30.0);
    let values = best.congestion_values();
    assert_eq!(values[2], 80.0);
    assert!((values[4] - 90.0).abs() < 1e-9);
    assert!(best.congestion_unknown);
}

#[::core::prelude::v1::test]
fn test_construction_opens_as_station() {
    let engine = TransitEngine::new(EngineConfig::default()).unwrap();
    let build = |year: i32, kind: NodeKind| {
        let nodes = vec![
            Node::new("m1", NodeKind::MetroStation, 12.97, 77.59, 2014),
            Node::new("m2", kind, 12.98, 77.61, 2016),
        ];
        let trips = vec![Trip::new("purple", "Purple Line", Mode::MetroLine, vec!["m1".into(), "m2".into()])];
        YearSnapshot::new(year, nodes, Vec::new(), trips).unwrap()
    };
    engine.insert_snapshot(build(2016, NodeKind::MetroUnderConstruction)).unwrap();
    engine.insert_snapshot(build(2019, NodeKind::MetroStation)).unwrap();

    let metro_only = GraphFilter {
        include_bus: false,
        include_metro: true,
        include_construction: false,
    };
    assert_eq!(engine.build_graph(2017, metro_only).unwrap().node_count(), 1);
    assert_eq!(engine.build_graph(2019, metro_only).unwrap().node_count(), 2);

    assert!(matches!(
        engine.insert_snapshot(build(2021, NodeKind::MetroUnderConstruction)),
        Err(Error::InvalidTransition { .. })
    ));
}

#[::core::prelude::v1::test]
fn test_exports_are_listed_with_checksums() {
    let dir = tempdir().unwrap();
    let manager = DatasetManager::open(dir.path(), EngineConfig::default()).unwrap();
    manager.add_snapshot(linear_record(2016)).unwrap();
    let mut grown = linear_record(2019);
    grown.nodes.push(Node::new("F", NodeKind::BusStop, 12.96, 77.61, 2019));
    grown.trips[0].stops.push("F".into());
    grown.trips[0].hop_times.push(5.0);
    manager.add_snapshot(grown).unwrap();

    manager.export_snapshot(2019).unwrap();
    manager.export_heat_index(2019, 3, &CancelToken::new()).unwrap();
    let (forecast, _) = manager.export_forecast(2022, &CancelToken::new()).unwrap();
    assert_eq!(forecast.base_year, 2019);
    assert!(forecast.nodes.iter().all(|n| n.projected));

    let artifacts = manager.list_artifacts().unwrap();
    let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["critical_nodes_2019.json", "data_2019.geojson", "predicted_map_2022.geojson"]
    );
    assert!(artifacts.iter().all(|a| a.checksum.as_ref().map_or(false, |c| c.len() == 64)));

    assert!(matches!(
        manager.export_forecast(2019, &CancelToken::new()),
        Err(Error::OutOfRangeYear { .. })
    ));
    assert!(matches!(
        manager.export_forecast(20000, &CancelToken::new()),
        Err(Error::OutOfRangeYear { year: 20000, max: 2049, .. })
    ));
}

#[actix_web::test]
async fn test_realtime_analysis_endpoint() {
    let dir = tempdir().unwrap();
    let manager = Arc::new(DatasetManager::open(dir.path(), EngineConfig::default()).unwrap());
    manager.add_snapshot(linear_record(2018)).unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(manager.clone()))
            .configure(transitx_api::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/stops").to_request();
    let stops: Vec<String> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(stops.len(), 5);
    assert_eq!(stops[0], "Stop A");

    let req = test::TestRequest::post()
        .uri("/realtime-analysis")
        .set_json(serde_json::json!({
            "source": "Stop A",
            "destination": "Stop E",
            "departure": "2024-05-06T08:00:00Z"
        }))
        .to_request();
    let routes: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    let best = &routes[0];
    assert_eq!(best["route_name"], "Line 1");
    assert_eq!(best["trip_id"], "line-1");
    assert_eq!(best["stops"], 5);
    assert_eq!(best["etas"][4], "08:20");
    assert_eq!(best["coordinates"].as_array().unwrap().len(), 5);

    let req = test::TestRequest::post()
        .uri("/realtime-analysis")
        .set_json(serde_json::json!({ "source": "Stop A", "destination": "Nowhere" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri("/api/congestion")
        .set_json(serde_json::json!([
            { "segment_id": "C", "congestion_percent": 85.0 },
            { "segment_id": "D", "current_speed": 5.0, "free_flow_speed": 50.0 }
        ]))
        .to_request();
    let ingested: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(ingested["ingested"], 2);

    let req = test::TestRequest::post()
        .uri("/api/congestion")
        .set_json(serde_json::json!([
            { "lat": 12.9201, "lon": 77.6001, "congestion_percent": 40.0 }
        ]))
        .to_request();
    let ingested: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(ingested["ingested"], 1);
    assert_eq!(manager.engine().congestion().store().sample_count(), 3);

    let req = test::TestRequest::post()
        .uri("/api/congestion")
        .set_json(serde_json::json!([{ "lat": 40.0, "lon": -74.0, "congestion_percent": 40.0 }]))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get().uri("/api/hotspots?limit=1").to_request();
    let hotspots: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(hotspots[0]["segment_id"], "D");

    let req = test::TestRequest::get().uri("/api/critical?year=2018&top_k=1").to_request();
    let index: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(index["entries"][0]["node_id"], "C");
    assert_eq!(index["entries"][0]["heat"], 100.0);

    let req = test::TestRequest::get().uri("/api/forecast?target_year=20000").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
}
