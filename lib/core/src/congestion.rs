//! Congestion samples, the append-only sample store and the model that turns
//! them into an effective congestion percent and a delay per segment.
//!
//! Resolution order for `effective_congestion(segment, at)`:
//! 1. latest sample inside the freshness window ending at `at`
//! 2. hour-of-day historical mean for the hour of `at`
//! 3. day-of-week historical mean for the weekday of `at`
//! 4. overall historical mean
//! 5. a registered baseline
//! 6. `0%` flagged as [`CongestionSource::Unknown`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::CongestionConfig;
use crate::{Error, Result};

/// One congestion reading for a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CongestionSample {
    pub segment_id: String,
    pub timestamp: DateTime<Utc>,
    pub congestion_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_flow_speed: Option<f64>,
}

impl CongestionSample {
    pub fn new(segment_id: impl Into<String>, timestamp: DateTime<Utc>, congestion_percent: f64) -> Result<Self> {
        let segment_id = segment_id.into();
        if !congestion_percent.is_finite() || !(0.0..=100.0).contains(&congestion_percent) {
            return Err(Error::DataInconsistency(format!(
                "congestion {} for segment {} is outside [0, 100]",
                congestion_percent, segment_id
            )));
        }
        Ok(Self {
            segment_id,
            timestamp,
            congestion_percent,
            current_speed: None,
            free_flow_speed: None,
        })
    }

    /// Congestion from a speed reading: `100 * (1 - current / free_flow)`, clamped.
    pub fn from_speeds(
        segment_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        current_speed: f64,
        free_flow_speed: f64,
    ) -> Result<Self> {
        let segment_id = segment_id.into();
        if !(current_speed.is_finite() && free_flow_speed.is_finite())
            || current_speed <= 0.0
            || free_flow_speed <= 0.0
        {
            return Err(Error::DataInconsistency(format!(
                "segment {} has unusable speeds {} / {}",
                segment_id, current_speed, free_flow_speed
            )));
        }
        let percent = (100.0 * (1.0 - current_speed / free_flow_speed)).clamp(0.0, 100.0);
        Ok(Self {
            segment_id,
            timestamp,
            congestion_percent: percent,
            current_speed: Some(current_speed),
            free_flow_speed: Some(free_flow_speed),
        })
    }

    /// Current over free-flow speed, when the sample came from speeds.
    pub fn speed_ratio(&self) -> Option<f64> {
        match (self.current_speed, self.free_flow_speed) {
            (Some(current), Some(free)) if free > 0.0 => Some(current / free),
            _ => None,
        }
    }
}

/// Where an effective congestion value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionSource {
    Live,
    HourlyBaseline,
    DailyBaseline,
    Baseline,
    /// Nothing known. The percent is the neutral `0` and must be flagged.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CongestionReading {
    pub percent: f64,
    pub source: CongestionSource,
}

impl CongestionReading {
    pub const UNKNOWN: CongestionReading = CongestionReading {
        percent: 0.0,
        source: CongestionSource::Unknown,
    };

    #[inline]
    pub fn is_unknown(&self) -> bool {
        self.source == CongestionSource::Unknown
    }
}

/// Delay multiplier `f` in `delay = base_travel_time * f(congestion_percent)`.
///
/// Every variant is non-decreasing in the congestion percent and bounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PenaltyCurve {
    /// `f(c) = c / 100 * max_multiplier`
    Linear { max_multiplier: f64 },
    /// `f(c) = multiplier` above `threshold`, else `0`
    Threshold { threshold: f64, multiplier: f64 },
    /// `0` up to `threshold`, then `((c - t) / (100 - t))^exponent * max_multiplier`
    Convex {
        threshold: f64,
        exponent: f64,
        max_multiplier: f64,
    },
}

impl Default for PenaltyCurve {
    /// Full congestion doubles the travel time.
    fn default() -> Self {
        PenaltyCurve::Linear { max_multiplier: 1.0 }
    }
}

impl PenaltyCurve {
    pub fn multiplier(&self, congestion_percent: f64) -> f64 {
        let c = congestion_percent.clamp(0.0, 100.0);
        match *self {
            PenaltyCurve::Linear { max_multiplier } => c / 100.0 * max_multiplier,
            PenaltyCurve::Threshold { threshold, multiplier } => {
                if c > threshold {
                    multiplier
                } else {
                    0.0
                }
            }
            PenaltyCurve::Convex {
                threshold,
                exponent,
                max_multiplier,
            } => {
                if c <= threshold || threshold >= 100.0 {
                    0.0
                } else {
                    ((c - threshold) / (100.0 - threshold)).powf(exponent) * max_multiplier
                }
            }
        }
    }

    #[inline]
    pub fn delay(&self, base_travel_time: f64, congestion_percent: f64) -> f64 {
        base_travel_time * self.multiplier(congestion_percent)
    }

    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            PenaltyCurve::Linear { max_multiplier } => max_multiplier.is_finite() && max_multiplier >= 0.0,
            PenaltyCurve::Threshold { threshold, multiplier } => {
                (0.0..=100.0).contains(&threshold) && multiplier.is_finite() && multiplier >= 0.0
            }
            PenaltyCurve::Convex {
                threshold,
                exponent,
                max_multiplier,
            } => {
                (0.0..100.0).contains(&threshold)
                    && exponent.is_finite()
                    && exponent > 0.0
                    && max_multiplier.is_finite()
                    && max_multiplier >= 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!("invalid penalty curve {:?}", self)))
        }
    }
}

/// Samples of one segment, kept sorted by timestamp.
#[derive(Debug, Default)]
struct SegmentHistory {
    samples: Vec<CongestionSample>,
    sum: f64,
    count: u64,
    hourly_sum: [f64; 24],
    hourly_count: [u32; 24],
    daily_sum: [f64; 7],
    daily_count: [u32; 7],
}

impl SegmentHistory {
    fn push(&mut self, sample: CongestionSample) {
        let hour = sample.timestamp.hour() as usize;
        let day = sample.timestamp.weekday().num_days_from_monday() as usize;
        self.sum += sample.congestion_percent;
        self.count += 1;
        self.hourly_sum[hour] += sample.congestion_percent;
        self.hourly_count[hour] += 1;
        self.daily_sum[day] += sample.congestion_percent;
        self.daily_count[day] += 1;

        // Samples with equal timestamps stay in arrival order.
        let pos = self.samples.partition_point(|s| s.timestamp <= sample.timestamp);
        self.samples.insert(pos, sample);
    }

    /// Newest sample with `at - window <= timestamp <= at`.
    /// Equal timestamps resolve to the later arrival.
    fn latest_within(&self, at: DateTime<Utc>, window: Duration) -> Option<&CongestionSample> {
        let end = self.samples.partition_point(|s| s.timestamp <= at);
        let candidate = self.samples[..end].last()?;
        (candidate.timestamp >= at - window).then_some(candidate)
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn hourly_mean(&self, hour: usize) -> Option<f64> {
        let count = self.hourly_count[hour];
        (count > 0).then(|| self.hourly_sum[hour] / f64::from(count))
    }

    fn daily_mean(&self, day: usize) -> Option<f64> {
        let count = self.daily_count[day];
        (count > 0).then(|| self.daily_sum[day] / f64::from(count))
    }
}

/// Historical congestion ranking entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub segment_id: String,
    pub mean_congestion: f64,
    pub samples: u64,
}

/// Append-only congestion sample store.
///
/// Writers serialize on the write lock; readers that need a consistent view
/// for a whole query take one [`CongestionStore::view`].
#[derive(Debug, Default)]
pub struct CongestionStore {
    segments: RwLock<AHashMap<String, SegmentHistory>>,
    baselines: RwLock<AHashMap<String, f64>>,
    total_samples: AtomicU64,
}

impl CongestionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, sample: CongestionSample) {
        let mut segments = self.segments.write();
        segments
            .entry(sample.segment_id.clone())
            .or_default()
            .push(sample);
        self.total_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Appends a batch under a single write lock.
    pub fn append_batch(&self, samples: Vec<CongestionSample>) -> usize {
        let count = samples.len();
        let mut segments = self.segments.write();
        for sample in samples {
            segments
                .entry(sample.segment_id.clone())
                .or_default()
                .push(sample);
        }
        self.total_samples.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Registers a precomputed historical average for a segment.
    pub fn set_baseline(&self, segment_id: impl Into<String>, percent: f64) -> Result<()> {
        let segment_id = segment_id.into();
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(Error::DataInconsistency(format!(
                "baseline {} for segment {} is outside [0, 100]",
                percent, segment_id
            )));
        }
        self.baselines.write().insert(segment_id, percent);
        Ok(())
    }

    #[inline]
    pub fn sample_count(&self) -> u64 {
        self.total_samples.load(Ordering::Relaxed)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn reading(&self, segment_id: &str, at: DateTime<Utc>, window: Duration) -> CongestionReading {
        let segments = self.segments.read();
        let baselines = self.baselines.read();
        Self::resolve(&segments, &baselines, segment_id, at, window)
    }

    /// Resolves every requested segment under one read lock, so a query
    /// never mixes readings from before and after a concurrent append.
    pub fn view<'a, I>(&self, segment_ids: I, at: DateTime<Utc>, window: Duration) -> CongestionView
    where
        I: IntoIterator<Item = &'a str>,
    {
        let segments = self.segments.read();
        let baselines = self.baselines.read();
        let mut readings = AHashMap::new();
        for segment_id in segment_ids {
            if readings.contains_key(segment_id) {
                continue;
            }
            let reading = Self::resolve(&segments, &baselines, segment_id, at, window);
            readings.insert(segment_id.to_string(), reading);
        }
        CongestionView { at, readings }
    }

    /// Latest fresh sample per segment, sorted by segment id.
    pub fn latest_samples(&self, at: DateTime<Utc>, window: Duration) -> Vec<CongestionSample> {
        let segments = self.segments.read();
        let mut latest: Vec<CongestionSample> = segments
            .values()
            .filter_map(|history| history.latest_within(at, window).cloned())
            .collect();
        latest.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));
        latest
    }

    /// Segments ranked by historical mean congestion, worst first.
    pub fn hotspots(&self, limit: usize) -> Vec<Hotspot> {
        let segments = self.segments.read();
        let mut hotspots: Vec<Hotspot> = segments
            .iter()
            .filter_map(|(segment_id, history)| {
                history.mean().map(|mean| Hotspot {
                    segment_id: segment_id.clone(),
                    mean_congestion: mean,
                    samples: history.count,
                })
            })
            .collect();
        hotspots.sort_by(|a, b| {
            b.mean_congestion
                .total_cmp(&a.mean_congestion)
                .then_with(|| a.segment_id.cmp(&b.segment_id))
        });
        hotspots.truncate(limit);
        hotspots
    }

    fn resolve(
        segments: &AHashMap<String, SegmentHistory>,
        baselines: &AHashMap<String, f64>,
        segment_id: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> CongestionReading {
        if let Some(history) = segments.get(segment_id) {
            if let Some(sample) = history.latest_within(at, window) {
                return CongestionReading {
                    percent: sample.congestion_percent,
                    source: CongestionSource::Live,
                };
            }
            if let Some(mean) = history.hourly_mean(at.hour() as usize) {
                return CongestionReading {
                    percent: mean.clamp(0.0, 100.0),
                    source: CongestionSource::HourlyBaseline,
                };
            }
            if let Some(mean) = history.daily_mean(at.weekday().num_days_from_monday() as usize) {
                return CongestionReading {
                    percent: mean.clamp(0.0, 100.0),
                    source: CongestionSource::DailyBaseline,
                };
            }
            if let Some(mean) = history.mean() {
                return CongestionReading {
                    percent: mean.clamp(0.0, 100.0),
                    source: CongestionSource::Baseline,
                };
            }
        }
        match baselines.get(segment_id) {
            Some(&percent) => CongestionReading {
                percent,
                source: CongestionSource::Baseline,
            },
            None => CongestionReading::UNKNOWN,
        }
    }
}

/// Frozen congestion readings for one query.
#[derive(Debug, Clone)]
pub struct CongestionView {
    at: DateTime<Utc>,
    readings: AHashMap<String, CongestionReading>,
}

impl CongestionView {
    #[inline]
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    #[inline]
    pub fn get(&self, segment_id: &str) -> CongestionReading {
        self.readings
            .get(segment_id)
            .copied()
            .unwrap_or(CongestionReading::UNKNOWN)
    }
}

/// Maps a segment and a time to a congestion percent and a delay.
#[derive(Debug, Clone)]
pub struct CongestionModel {
    store: Arc<CongestionStore>,
    config: CongestionConfig,
}

impl CongestionModel {
    pub fn new(store: Arc<CongestionStore>, config: CongestionConfig) -> Self {
        Self { store, config }
    }

    #[inline]
    pub fn store(&self) -> &Arc<CongestionStore> {
        &self.store
    }

    #[inline]
    pub fn penalty(&self) -> &PenaltyCurve {
        &self.config.penalty
    }

    #[inline]
    pub fn freshness_window(&self) -> Duration {
        Duration::minutes(self.config.freshness_window_minutes)
    }

    pub fn effective_congestion(&self, segment_id: &str, at: DateTime<Utc>) -> CongestionReading {
        self.store.reading(segment_id, at, self.freshness_window())
    }

    pub fn view<'a, I>(&self, segment_ids: I, at: DateTime<Utc>) -> CongestionView
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.store.view(segment_ids, at, self.freshness_window())
    }
}
