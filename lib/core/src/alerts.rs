use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AlertPolicy;
use crate::congestion::CongestionSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Congestion,
    SpeedReduction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub segment_id: String,
    pub alert_type: AlertType,
    /// 0 to 10.
    pub severity: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Alerts for the given latest-per-segment samples, most severe first.
pub fn detect_alerts(samples: &[CongestionSample], policy: &AlertPolicy) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for sample in samples {
        if sample.congestion_percent >= policy.severe_congestion {
            alerts.push(Alert {
                segment_id: sample.segment_id.clone(),
                alert_type: AlertType::Congestion,
                severity: (sample.congestion_percent / 10.0).min(10.0),
                message: format!(
                    "Severe congestion on {}: {:.0}%",
                    sample.segment_id, sample.congestion_percent
                ),
                timestamp: sample.timestamp,
            });
        }
        if let Some(ratio) = sample.speed_ratio() {
            if ratio <= policy.speed_ratio {
                alerts.push(Alert {
                    segment_id: sample.segment_id.clone(),
                    alert_type: AlertType::SpeedReduction,
                    severity: ((1.0 - ratio) * 10.0).clamp(0.0, 10.0),
                    message: format!(
                        "Speed on {} down to {:.0}% of free flow",
                        sample.segment_id,
                        ratio * 100.0
                    ),
                    timestamp: sample.timestamp,
                });
            }
        }
    }
    alerts.sort_by(|a, b| {
        b.severity
            .total_cmp(&a.severity)
            .then_with(|| a.segment_id.cmp(&b.segment_id))
            .then_with(|| (a.alert_type as u8).cmp(&(b.alert_type as u8)))
    });
    alerts
}
