//! Artifacts consumed by the map and dashboard layers: per-year GeoJSON,
//! the critical-node heat index and the forecast map data.

use anyhow::Result;
use atomicwrites::{AllowOverwrite, AtomicFile};
use chrono::{DateTime, Utc};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, JsonObject, JsonValue, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use transitx_core::{CriticalityScore, Forecast, MultiplexGraph, Node, NodeKind, YearSnapshot};

/// Artifact description for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescription {
    pub name: String,
    pub creation_time: Option<String>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatIndexEntry {
    pub node_id: String,
    pub name: String,
    pub kind: NodeKind,
    pub lat: f64,
    pub lon: f64,
    pub loss: f64,
    /// Loss relative to the worst node, 0 to 100.
    pub heat: f64,
    pub rank: usize,
    pub approximate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatIndex {
    pub year: i32,
    pub snapshot_year: i32,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<HeatIndexEntry>,
}

pub fn marker_color(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::MetroStation => "blue",
        NodeKind::MetroUnderConstruction => "yellow",
        NodeKind::BusStop => "red",
        NodeKind::RoadJunction => "grey",
    }
}

/// OSM-style tags the map layer keys marker colours on.
fn kind_tags(kind: NodeKind, props: &mut JsonObject) {
    let tags: &[(&str, &str)] = match kind {
        NodeKind::BusStop => &[("highway", "bus_stop")],
        NodeKind::MetroStation => &[("network", "Namma Metro"), ("station", "subway")],
        NodeKind::MetroUnderConstruction => &[("construction", "station"), ("railway", "construction")],
        NodeKind::RoadJunction => &[("highway", "junction")],
    };
    for (key, value) in tags {
        props.insert((*key).to_string(), JsonValue::from(*value));
    }
}

fn point_feature(id: &str, lat: f64, lon: f64, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Point(vec![lon, lat]))),
        id: Some(geojson::feature::Id::String(id.to_string())),
        properties: Some(properties),
        foreign_members: None,
    }
}

fn node_feature(node: &Node) -> Feature {
    let mut props = JsonObject::new();
    props.insert("id".to_string(), JsonValue::from(node.id.as_str()));
    props.insert("name".to_string(), JsonValue::from(node.display_name()));
    props.insert("kind".to_string(), JsonValue::from(node.kind.as_str()));
    props.insert("marker_color".to_string(), JsonValue::from(marker_color(node.kind)));
    props.insert("first_seen".to_string(), JsonValue::from(node.first_seen));
    if let Some(last_seen) = node.last_seen {
        props.insert("last_seen".to_string(), JsonValue::from(last_seen));
    }
    kind_tags(node.kind, &mut props);
    point_feature(&node.id, node.lat, node.lon, props)
}

/// One Point feature per node of the snapshot.
pub fn snapshot_feature_collection(snapshot: &YearSnapshot) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features: snapshot.nodes().iter().map(node_feature).collect(),
        foreign_members: None,
    }
}

/// Projected nodes as points and projected edges as lines to the existing
/// network of `base`. Every feature carries `projected: true`.
pub fn forecast_feature_collection(forecast: &Forecast, base: &YearSnapshot) -> FeatureCollection {
    let mut features = Vec::with_capacity(forecast.nodes.len() + forecast.edges.len());

    for node in &forecast.nodes {
        let mut props = JsonObject::new();
        props.insert("id".to_string(), JsonValue::from(node.id.as_str()));
        props.insert("kind".to_string(), JsonValue::from(node.kind.as_str()));
        props.insert("year".to_string(), JsonValue::from(node.year));
        props.insert("cluster".to_string(), JsonValue::from(node.cluster));
        props.insert("marker_color".to_string(), JsonValue::from(marker_color(node.kind)));
        props.insert("projected".to_string(), JsonValue::from(node.projected));
        kind_tags(node.kind, &mut props);
        features.push(point_feature(&node.id, node.lat, node.lon, props));
    }

    for edge in &forecast.edges {
        let from = forecast.nodes.iter().find(|n| n.id == edge.from).map(|n| (n.lon, n.lat));
        let to = base.node(&edge.to).map(|n| (n.lon, n.lat));
        let (Some(from), Some(to)) = (from, to) else {
            continue;
        };
        let mut props = JsonObject::new();
        props.insert("from".to_string(), JsonValue::from(edge.from.as_str()));
        props.insert("to".to_string(), JsonValue::from(edge.to.as_str()));
        props.insert("mode".to_string(), JsonValue::from(edge.mode.as_str()));
        props.insert("base_travel_time".to_string(), JsonValue::from(edge.base_travel_time));
        props.insert("projected".to_string(), JsonValue::from(edge.projected));
        features.push(Feature {
            bbox: None,
            geometry: Some(Geometry::new(Value::LineString(vec![
                vec![from.0, from.1],
                vec![to.0, to.1],
            ]))),
            id: None,
            properties: Some(props),
            foreign_members: None,
        });
    }

    for transition in &forecast.transitions {
        let Some(node) = base.node(&transition.node_id) else {
            continue;
        };
        let mut props = JsonObject::new();
        props.insert("id".to_string(), JsonValue::from(node.id.as_str()));
        props.insert("name".to_string(), JsonValue::from(node.display_name()));
        props.insert("kind".to_string(), JsonValue::from(transition.to.as_str()));
        props.insert("expected_year".to_string(), JsonValue::from(transition.expected_year));
        props.insert("marker_color".to_string(), JsonValue::from(marker_color(transition.to)));
        props.insert("projected".to_string(), JsonValue::from(transition.projected));
        features.push(point_feature(&node.id, node.lat, node.lon, props));
    }

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// Scores joined with node positions, `heat` scaled so the worst node is 100.
pub fn heat_index(year: i32, graph: &MultiplexGraph, scores: &[CriticalityScore]) -> HeatIndex {
    let max_loss = scores.iter().map(|s| s.loss).fold(0.0, f64::max);
    let entries = scores
        .iter()
        .filter_map(|score| {
            let node = graph.node(graph.index_of(&score.node_id)?);
            Some(HeatIndexEntry {
                node_id: score.node_id.clone(),
                name: node.display_name().to_string(),
                kind: score.kind,
                lat: node.lat,
                lon: node.lon,
                loss: score.loss,
                heat: if max_loss > 0.0 { score.loss / max_loss * 100.0 } else { 0.0 },
                rank: score.rank,
                approximate: score.approximate,
            })
        })
        .collect();
    HeatIndex {
        year,
        snapshot_year: graph.snapshot_year(),
        generated_at: Utc::now(),
        entries,
    }
}

/// Writes artifacts atomically into one directory and describes them.
pub struct ArtifactManager {
    artifact_dir: PathBuf,
}

impl ArtifactManager {
    pub fn new<P: AsRef<Path>>(artifact_dir: P) -> Result<Self> {
        let artifact_dir = artifact_dir.as_ref().to_path_buf();
        fs::create_dir_all(&artifact_dir)?;
        Ok(Self { artifact_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.artifact_dir.join(name)
    }

    /// Replaces `name` with `bytes` in one rename.
    pub fn write(&self, name: &str, bytes: &[u8]) -> Result<ArtifactDescription> {
        let path = self.path_of(name);
        AtomicFile::new(&path, AllowOverwrite).write(|f| f.write_all(bytes))?;
        info!("Wrote {} ({} bytes)", path.display(), bytes.len());
        Self::describe(&path)
    }

    pub fn write_snapshot(&self, snapshot: &YearSnapshot) -> Result<ArtifactDescription> {
        let body = GeoJson::from(snapshot_feature_collection(snapshot)).to_string();
        self.write(&format!("data_{}.geojson", snapshot.year()), body.as_bytes())
    }

    pub fn write_heat_index(&self, index: &HeatIndex) -> Result<ArtifactDescription> {
        let body = serde_json::to_vec_pretty(index)?;
        self.write(&format!("critical_nodes_{}.json", index.year), &body)
    }

    pub fn write_forecast(&self, forecast: &Forecast, base: &YearSnapshot) -> Result<ArtifactDescription> {
        let body = GeoJson::from(forecast_feature_collection(forecast, base)).to_string();
        self.write(&format!("predicted_map_{}.geojson", forecast.target_year), body.as_bytes())
    }

    pub fn describe(path: &Path) -> Result<ArtifactDescription> {
        let metadata = fs::metadata(path)?;
        let file_data = fs::read(path)?;
        let checksum = format!("{:x}", Sha256::digest(&file_data));
        let creation_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0))
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string());

        Ok(ArtifactDescription {
            name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
            creation_time,
            size: metadata.len(),
            checksum: Some(checksum),
        })
    }

    /// All artifacts, sorted by name.
    pub fn list(&self) -> Result<Vec<ArtifactDescription>> {
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(&self.artifact_dir)? {
            let path = entry?.path();
            if path.is_file() {
                artifacts.push(Self::describe(&path)?);
            }
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }
}
