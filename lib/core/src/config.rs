use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::congestion::PenaltyCurve;
use crate::{Error, Result};

/// Years the dataset covers. Queries outside fail with `OutOfRangeYear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub min: i32,
    pub max: i32,
}

impl YearRange {
    #[inline]
    pub fn contains(&self, year: i32) -> bool {
        self.min <= year && year <= self.max
    }

    pub fn check(&self, year: i32) -> Result<()> {
        if self.contains(year) {
            Ok(())
        } else {
            Err(Error::OutOfRangeYear {
                year,
                min: self.min,
                max: self.max,
            })
        }
    }
}

impl Default for YearRange {
    fn default() -> Self {
        Self { min: 2014, max: 2025 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    /// How old (in minutes) a sample may be and still count as live.
    pub freshness_window_minutes: i64,
    pub penalty: PenaltyCurve,
    /// Furthest a coordinate-tagged sample may lie from its nearest node.
    pub max_snap_meters: f64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            freshness_window_minutes: 15,
            penalty: PenaltyCurve::default(),
            max_snap_meters: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalityConfig {
    /// Graphs with at most this many nodes get the exact all-pairs metric.
    pub exact_node_limit: usize,
    /// Number of sampled sources for the approximate estimator.
    pub sample_sources: usize,
    /// A pair counts as degraded when its cost grows by more than this ratio.
    pub cost_increase_ratio: f64,
    pub seed: u64,
}

impl Default for CriticalityConfig {
    fn default() -> Self {
        Self {
            exact_node_limit: 150,
            sample_sources: 32,
            cost_increase_ratio: 0.5,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub cluster_count: usize,
    pub seed: u64,
    /// Used when no construction-to-opening history is observed.
    pub default_construction_years: i32,
    pub metro_speed_kmh: f64,
    pub bus_speed_kmh: f64,
    pub road_speed_kmh: f64,
    /// Furthest target year accepted, counted from the last snapshot.
    pub max_horizon_years: i32,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            cluster_count: 4,
            seed: 7,
            default_construction_years: 3,
            metro_speed_kmh: 34.0,
            bus_speed_kmh: 18.0,
            road_speed_kmh: 25.0,
            max_horizon_years: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertPolicy {
    /// Congestion percent at or above which a segment is severely congested.
    pub severe_congestion: f64,
    /// Speed ratio (current / free flow) at or below which speed has collapsed.
    pub speed_ratio: f64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            severe_congestion: 80.0,
            speed_ratio: 0.4,
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub year_range: YearRange,
    pub graph_cache_capacity: usize,
    /// Hop time for trips that carry no explicit hop times.
    pub default_hop_minutes: f64,
    pub congestion: CongestionConfig,
    pub criticality: CriticalityConfig,
    pub forecast: ForecastConfig,
    pub alerts: AlertPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            year_range: YearRange::default(),
            graph_cache_capacity: 16,
            default_hop_minutes: 2.0,
            congestion: CongestionConfig::default(),
            criticality: CriticalityConfig::default(),
            forecast: ForecastConfig::default(),
            alerts: AlertPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.year_range.min > self.year_range.max {
            return Err(Error::InvalidConfig(format!(
                "year_range min {} is after max {}",
                self.year_range.min, self.year_range.max
            )));
        }
        if self.graph_cache_capacity == 0 {
            return Err(Error::InvalidConfig("graph_cache_capacity must be positive".into()));
        }
        if !(self.default_hop_minutes.is_finite() && self.default_hop_minutes >= 0.0) {
            return Err(Error::InvalidConfig("default_hop_minutes must be >= 0".into()));
        }
        if self.congestion.freshness_window_minutes < 0 {
            return Err(Error::InvalidConfig("freshness_window_minutes must be >= 0".into()));
        }
        if !(self.congestion.max_snap_meters.is_finite() && self.congestion.max_snap_meters >= 0.0) {
            return Err(Error::InvalidConfig("congestion.max_snap_meters must be >= 0".into()));
        }
        self.congestion.penalty.validate()?;
        if self.criticality.sample_sources == 0 {
            return Err(Error::InvalidConfig("criticality.sample_sources must be positive".into()));
        }
        if self.criticality.cost_increase_ratio < 0.0 {
            return Err(Error::InvalidConfig("criticality.cost_increase_ratio must be >= 0".into()));
        }
        if self.forecast.cluster_count == 0 {
            return Err(Error::InvalidConfig("forecast.cluster_count must be positive".into()));
        }
        if self.forecast.max_horizon_years <= 0 {
            return Err(Error::InvalidConfig("forecast.max_horizon_years must be positive".into()));
        }
        let speeds = [
            self.forecast.metro_speed_kmh,
            self.forecast.bus_speed_kmh,
            self.forecast.road_speed_kmh,
        ];
        if speeds.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(Error::InvalidConfig("forecast speeds must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.alerts.speed_ratio) {
            return Err(Error::InvalidConfig("alerts.speed_ratio must be within [0, 1]".into()));
        }
        Ok(())
    }
}
