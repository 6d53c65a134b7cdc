//! Snapshot files: JSON records and OSM-tagged GeoJSON.

use anyhow::{anyhow, Context, Result};
use geojson::{GeoJson, JsonObject, JsonValue};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use transitx_core::{Edge, Error, Node, NodeKind, Trip, YearSnapshot};

/// On-disk form of one year: `snapshots/<year>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub year: i32,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub trips: Vec<Trip>,
}

impl SnapshotRecord {
    pub fn from_snapshot(snapshot: &YearSnapshot) -> Self {
        Self {
            year: snapshot.year(),
            nodes: snapshot.nodes().to_vec(),
            edges: snapshot.edges().to_vec(),
            trips: snapshot.trips().to_vec(),
        }
    }

    pub fn into_snapshot(self) -> transitx_core::Result<YearSnapshot> {
        YearSnapshot::new(self.year, self.nodes, self.edges, self.trips)
    }
}

/// Where a snapshot file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Record,
    GeoJson,
}

/// Snapshot files in `dir`, sorted by year. `<year>.json` records and
/// `data_<year>.geojson` exports are recognised; anything else is ignored.
pub fn discover(dir: &Path) -> Result<Vec<(i32, SnapshotFormat, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(year) = name.strip_suffix(".json").and_then(|s| s.parse::<i32>().ok()) {
            found.push((year, SnapshotFormat::Record, path));
        } else if let Some(year) = name
            .strip_prefix("data_")
            .and_then(|s| s.strip_suffix(".geojson"))
            .and_then(|s| s.parse::<i32>().ok())
        {
            found.push((year, SnapshotFormat::GeoJson, path));
        } else {
            debug!("Ignoring {}", path.display());
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| (a.1 as u8).cmp(&(b.1 as u8))));
    Ok(found)
}

pub fn load_record(path: &Path) -> Result<YearSnapshot> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let record: SnapshotRecord =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(record.into_snapshot()?)
}

pub fn load_geojson(path: &Path, year: i32) -> Result<YearSnapshot> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let nodes = nodes_from_geojson(&raw, year)?;
    Ok(YearSnapshot::new(year, nodes, Vec::new(), Vec::new())?)
}

/// Nodes from a tagged FeatureCollection.
///
/// The kind comes from the OSM tags the map layer uses: `construction` /
/// `railway=construction` for stations being built, `station=subway` or a
/// metro `network` for stations, `highway=bus_stop` for bus stops and
/// `highway=junction` for road junctions. A `kind` property wins over tags.
pub fn nodes_from_geojson(raw: &str, year: i32) -> Result<Vec<Node>> {
    let geojson: GeoJson = raw.parse().map_err(|e| anyhow!("Invalid GeoJSON: {}", e))?;
    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err(anyhow!("Expected a FeatureCollection"));
    };

    let mut nodes = Vec::with_capacity(collection.features.len());
    for (i, feature) in collection.features.into_iter().enumerate() {
        let Some(geojson::Value::Point(coords)) = feature.geometry.as_ref().map(|g| &g.value) else {
            debug!("Skipping feature {} without point geometry", i);
            continue;
        };
        if coords.len() < 2 {
            return Err(Error::DataInconsistency(format!("feature {} has a malformed point", i)).into());
        }
        let (lon, lat) = (coords[0], coords[1]);

        let empty = JsonObject::new();
        let props = feature.properties.as_ref().unwrap_or(&empty);

        let id = text(props, "id")
            .or_else(|| text(props, "@id"))
            .or_else(|| match &feature.id {
                Some(geojson::feature::Id::String(s)) => Some(s.clone()),
                Some(geojson::feature::Id::Number(n)) => Some(n.to_string()),
                None => None,
            })
            .ok_or_else(|| Error::DataInconsistency(format!("feature {} has no id", i)))?;

        let kind = kind_from_tags(props)
            .ok_or_else(|| Error::DataInconsistency(format!("feature {} ({}) has no recognisable kind", i, id)))?;

        let name = text(props, "name")
            .or_else(|| text(props, "loc_name"))
            .or_else(|| text(props, "alt_name"))
            .unwrap_or_default();
        let first_seen = props
            .get("first_seen")
            .and_then(JsonValue::as_i64)
            .map_or(year, |y| y as i32);
        let last_seen = props
            .get("last_seen")
            .and_then(JsonValue::as_i64)
            .map(|y| y as i32);

        let mut node = Node::new(id, kind, lat, lon, first_seen).with_name(name);
        node.last_seen = last_seen;
        nodes.push(node);
    }
    Ok(nodes)
}

fn text(props: &JsonObject, key: &str) -> Option<String> {
    match props.get(key)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn kind_from_tags(props: &JsonObject) -> Option<NodeKind> {
    if let Some(kind) = props.get("kind") {
        if let Ok(kind) = serde_json::from_value::<NodeKind>(kind.clone()) {
            return Some(kind);
        }
    }
    let tag = |key: &str| props.get(key).and_then(JsonValue::as_str);

    if tag("construction") == Some("station") || tag("railway") == Some("construction") {
        return Some(NodeKind::MetroUnderConstruction);
    }
    if tag("station") == Some("subway")
        || tag("railway") == Some("station")
        || tag("network").map_or(false, |n| n.contains("Metro"))
    {
        return Some(NodeKind::MetroStation);
    }
    match tag("highway") {
        Some("bus_stop") => Some(NodeKind::BusStop),
        Some("junction") | Some("traffic_signals") => Some(NodeKind::RoadJunction),
        _ if tag("public_transport").is_some() && tag("bus") == Some("yes") => Some(NodeKind::BusStop),
        _ => None,
    }
}
