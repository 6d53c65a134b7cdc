use actix_web::{web, App, HttpServer, HttpResponse, Result as ActixResult};
use actix_cors::Cors;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use transitx_core::{
    CancelToken, CongestionSample, Error, GraphFilter, RouteCandidate, RouteQuery, TransitEngine,
    YearSnapshot,
};
use transitx_storage::{DatasetManager, HeatIndex};

const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Deserialize)]
struct RealtimeAnalysisRequest {
    source: String,
    destination: String,
    year: Option<i32>,
    max_results: Option<usize>,
    departure: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    include_bus: bool,
    #[serde(default = "default_true")]
    include_metro: bool,
    #[serde(default = "default_true")]
    include_construction: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct StopCoord {
    id: String,
    name: String,
    lat: f64,
    lon: f64,
}

#[derive(Serialize)]
struct RouteResponse {
    route_name: String,
    trip_id: String,
    stops: usize,
    avg_congestion: Option<f64>,
    est_delay_min: f64,
    coordinates: Vec<[f64; 2]>,
    stop_coords: Vec<StopCoord>,
    congestion_values: Vec<f64>,
    congestion_unknown: Vec<bool>,
    etas: Vec<String>,
}

#[derive(Deserialize)]
struct CriticalQuery {
    year: Option<i32>,
    top_k: Option<usize>,
}

#[derive(Deserialize)]
struct ForecastQuery {
    target_year: i32,
}

#[derive(Deserialize)]
struct HotspotQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SampleRequest {
    segment_id: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    timestamp: Option<DateTime<Utc>>,
    congestion_percent: Option<f64>,
    current_speed: Option<f64>,
    free_flow_speed: Option<f64>,
}

impl SampleRequest {
    /// Samples name a segment directly or carry a coordinate snapped to the
    /// nearest node of the latest snapshot.
    fn into_sample(self, engine: &TransitEngine, now: DateTime<Utc>) -> transitx_core::Result<CongestionSample> {
        let segment_id = match (self.segment_id, self.lat, self.lon) {
            (Some(id), _, _) => id,
            (None, Some(lat), Some(lon)) => engine.snap_to_segment(lat, lon)?,
            _ => {
                return Err(Error::DataInconsistency(
                    "sample needs segment_id or both lat and lon".into(),
                ))
            }
        };
        let timestamp = self.timestamp.unwrap_or(now);
        match (self.congestion_percent, self.current_speed, self.free_flow_speed) {
            (Some(percent), _, _) => {
                let mut sample = CongestionSample::new(segment_id, timestamp, percent)?;
                sample.current_speed = self.current_speed;
                sample.free_flow_speed = self.free_flow_speed;
                Ok(sample)
            }
            (None, Some(current), Some(free_flow)) => {
                CongestionSample::from_speeds(segment_id, timestamp, current, free_flow)
            }
            _ => Err(Error::DataInconsistency(format!(
                "sample for {} needs congestion_percent or both speeds",
                segment_id
            ))),
        }
    }
}

pub struct RestApi;

impl RestApi {
    pub async fn start(
        manager: Arc<DatasetManager>,
        port: u16,
    ) -> std::io::Result<()> {
        HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .wrap(cors)
                .app_data(web::Data::new(manager.clone()))
                .configure(configure)
        })
        .bind(("0.0.0.0", port))?
        .run()
        .await
    }
}

/// Route table, shared with tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/stops", web::get().to(list_stops))
        .route("/realtime-analysis", web::post().to(realtime_analysis))
        .route("/api/critical", web::get().to(critical_nodes))
        .route("/api/forecast", web::get().to(forecast))
        .route("/api/snapshots/{year}", web::get().to(snapshot_geojson))
        .route("/api/congestion", web::post().to(ingest_congestion))
        .route("/api/alerts", web::get().to(alerts))
        .route("/api/hotspots", web::get().to(hotspots))
        .route("/api/artifacts", web::get().to(list_artifacts));
}

fn error_response(e: &Error) -> HttpResponse {
    match e {
        Error::Unreachable { .. } => HttpResponse::NotFound().json(serde_json::json!({
            "error": "No routes found between stops."
        })),
        Error::InvalidEndpoints(_) => HttpResponse::NotFound().json(serde_json::json!({
            "error": e.to_string()
        })),
        Error::OutOfRangeYear { .. }
        | Error::DataInconsistency(_)
        | Error::InvalidTransition { .. }
        | Error::SnapshotExists(_)
        | Error::InvalidConfig(_) => HttpResponse::BadRequest().json(serde_json::json!({
            "error": e.to_string()
        })),
        Error::Cancelled => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "error": "Query timed out"
        })),
        Error::Io(_) | Error::Serialization(_) => {
            warn!("Request failed: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": e.to_string()
            }))
        }
    }
}

async fn list_stops(
    manager: web::Data<Arc<DatasetManager>>,
) -> ActixResult<HttpResponse> {
    match manager.engine().stop_names(None) {
        Ok(names) => Ok(HttpResponse::Ok().json(names)),
        Err(e) => Ok(error_response(&e)),
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn route_response(candidate: &RouteCandidate, snapshot: &YearSnapshot, departure: DateTime<Utc>) -> RouteResponse {
    let trip_id = candidate.primary_route_ref().unwrap_or_default().to_string();
    let route_name = snapshot
        .trip(&trip_id)
        .map(|t| t.route_name.clone())
        .unwrap_or_else(|| {
            candidate
                .legs
                .first()
                .map(|l| l.mode.as_str().to_string())
                .unwrap_or_default()
        });

    let stop_coords: Vec<StopCoord> = candidate
        .nodes
        .iter()
        .filter_map(|id| snapshot.node(id))
        .map(|n| StopCoord {
            id: n.id.clone(),
            name: n.display_name().to_string(),
            lat: n.lat,
            lon: n.lon,
        })
        .collect();

    RouteResponse {
        route_name,
        trip_id,
        stops: candidate.stops(),
        avg_congestion: candidate.avg_congestion.map(round1),
        est_delay_min: round1(candidate.delay),
        coordinates: stop_coords.iter().map(|c| [c.lat, c.lon]).collect(),
        stop_coords,
        congestion_values: candidate.congestion_values(),
        congestion_unknown: candidate.congestion.iter().map(|c| c.congestion_unknown).collect(),
        etas: candidate
            .arrival_offsets
            .iter()
            .map(|minutes| {
                (departure + Duration::seconds((minutes * 60.0).round() as i64))
                    .format("%H:%M")
                    .to_string()
            })
            .collect(),
    }
}

async fn realtime_analysis(
    manager: web::Data<Arc<DatasetManager>>,
    req: web::Json<RealtimeAnalysisRequest>,
) -> ActixResult<HttpResponse> {
    let req = req.into_inner();
    let manager = manager.get_ref().clone();

    let result = web::block(move || -> transitx_core::Result<Vec<RouteResponse>> {
        let engine = manager.engine();
        let year = match req.year {
            Some(year) => year,
            None => engine
                .latest_year()
                .ok_or_else(|| Error::DataInconsistency("no snapshot has been loaded".into()))?,
        };
        let departure = req.departure.unwrap_or_else(Utc::now);
        let query = RouteQuery::new(year, req.source, req.destination)
            .with_filter(GraphFilter {
                include_bus: req.include_bus,
                include_metro: req.include_metro,
                include_construction: req.include_construction,
            })
            .with_max_results(req.max_results.unwrap_or(3))
            .at(departure);

        let plan = engine.find_routes(&query, &CancelToken::with_timeout(QUERY_TIMEOUT))?;
        let snapshot = engine.store().snapshot_for(plan.graph.snapshot_year())?;
        Ok(plan
            .candidates
            .iter()
            .map(|c| route_response(c, &snapshot, departure))
            .collect())
    })
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    match result {
        Ok(routes) => Ok(HttpResponse::Ok().json(routes)),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn critical_nodes(
    manager: web::Data<Arc<DatasetManager>>,
    query: web::Query<CriticalQuery>,
) -> ActixResult<HttpResponse> {
    let query = query.into_inner();
    let manager = manager.get_ref().clone();

    let result = web::block(move || -> transitx_core::Result<HeatIndex> {
        let year = match query.year {
            Some(year) => year,
            None => manager
                .engine()
                .latest_year()
                .ok_or_else(|| Error::DataInconsistency("no snapshot has been loaded".into()))?,
        };
        manager.compute_heat_index(year, query.top_k.unwrap_or(20), &CancelToken::with_timeout(QUERY_TIMEOUT))
    })
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    match result {
        Ok(index) => Ok(HttpResponse::Ok().json(index)),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn forecast(
    manager: web::Data<Arc<DatasetManager>>,
    query: web::Query<ForecastQuery>,
) -> ActixResult<HttpResponse> {
    let target_year = query.target_year;
    let manager = manager.get_ref().clone();

    let result = web::block(move || {
        manager.export_forecast(target_year, &CancelToken::with_timeout(QUERY_TIMEOUT))
    })
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    match result {
        Ok((forecast, artifact)) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "forecast": forecast,
            "artifact": artifact,
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn snapshot_geojson(
    manager: web::Data<Arc<DatasetManager>>,
    path: web::Path<i32>,
) -> ActixResult<HttpResponse> {
    let year = path.into_inner();
    match manager.engine().store().snapshot_for(year) {
        Ok(snapshot) => {
            let body = geojson_body(&snapshot);
            Ok(HttpResponse::Ok()
                .content_type("application/geo+json")
                .body(body))
        }
        Err(e) => Ok(error_response(&e)),
    }
}

fn geojson_body(snapshot: &YearSnapshot) -> String {
    geojson::GeoJson::from(transitx_storage::export::snapshot_feature_collection(snapshot)).to_string()
}

async fn ingest_congestion(
    manager: web::Data<Arc<DatasetManager>>,
    req: web::Json<Vec<SampleRequest>>,
) -> ActixResult<HttpResponse> {
    let now = Utc::now();
    let samples: transitx_core::Result<Vec<CongestionSample>> =
        req.into_inner().into_iter().map(|s| s.into_sample(manager.engine(), now)).collect();
    let samples = match samples {
        Ok(samples) => samples,
        Err(e) => return Ok(error_response(&e)),
    };

    match manager.ingest(samples) {
        Ok(count) => Ok(HttpResponse::Ok().json(serde_json::json!({ "ingested": count }))),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn alerts(
    manager: web::Data<Arc<DatasetManager>>,
) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(manager.engine().alerts(Utc::now())))
}

async fn hotspots(
    manager: web::Data<Arc<DatasetManager>>,
    query: web::Query<HotspotQuery>,
) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(manager.engine().hotspots(query.limit.unwrap_or(10))))
}

async fn list_artifacts(
    manager: web::Data<Arc<DatasetManager>>,
) -> ActixResult<HttpResponse> {
    match manager.list_artifacts() {
        Ok(artifacts) => Ok(HttpResponse::Ok().json(artifacts)),
        Err(e) => Ok(error_response(&e)),
    }
}
