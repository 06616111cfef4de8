use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FaninError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_prometheus_type(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// How per-process gauge values are combined into one series value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeMode {
    #[default]
    Sum,
    Max,
    Min,
    MostRecent,
    LiveSum,
}

impl GaugeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
            Self::MostRecent => "most_recent",
            Self::LiveSum => "live_sum",
        }
    }
}

/// Self-describing identity of one series as written by one process.
///
/// Serialized into every file slot and every Redis meta key so a reader that
/// never saw the registration can still decode the sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub name: String,
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gauge_mode: Option<GaugeMode>,
    pub label_names: Vec<String>,
    pub label_values: Vec<String>,
    /// Finite histogram upper bounds; the `+Inf` bucket is implicit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<f64>,
}

impl SeriesMeta {
    pub fn key(&self) -> SeriesKey {
        SeriesKey {
            name: self.name.clone(),
            label_values: self.label_values.clone(),
        }
    }

    pub fn canonical(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| {
            FaninError::InternalError(format!("failed to encode series {}: {err}", self.name))
        })
    }

    /// First 16 bytes of the SHA-256 of the canonical encoding, hex encoded.
    pub fn series_hash(&self) -> Result<String> {
        let canonical = self.canonical()?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(&digest[..16]))
    }

    /// Number of f64 cells a sample of this series occupies.
    pub fn value_count(&self) -> usize {
        match self.kind {
            MetricKind::Counter | MetricKind::Gauge => 1,
            // one cumulative count per bucket including +Inf, then sum and count
            MetricKind::Histogram => self.buckets.len() + 3,
        }
    }

    /// Upper bounds including the trailing `+Inf`.
    pub fn bucket_bounds(&self) -> Vec<f64> {
        let mut bounds = self.buckets.clone();
        bounds.push(f64::INFINITY);
        bounds
    }

    pub fn gauge_mode(&self) -> GaugeMode {
        self.gauge_mode.unwrap_or_default()
    }

    /// Two processes agree on a metric when everything but the label values
    /// matches.
    pub fn same_shape(&self, other: &SeriesMeta) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.gauge_mode == other.gauge_mode
            && self.label_names == other.label_names
            && self.buckets == other.buckets
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: String,
    pub label_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Scalar {
        value: f64,
        timestamp: f64,
    },
    Histogram {
        /// Cumulative counts, one per bound of `SeriesMeta::bucket_bounds`.
        cumulative: Vec<f64>,
        sum: f64,
        count: f64,
        timestamp: f64,
    },
}

impl SampleValue {
    pub fn empty(meta: &SeriesMeta) -> Self {
        match meta.kind {
            MetricKind::Counter | MetricKind::Gauge => Self::Scalar {
                value: 0.0,
                timestamp: 0.0,
            },
            MetricKind::Histogram => Self::Histogram {
                cumulative: vec![0.0; meta.buckets.len() + 1],
                sum: 0.0,
                count: 0.0,
                timestamp: 0.0,
            },
        }
    }

    /// Rebuilds a sample from the flat cell layout shared by both backends.
    pub fn from_cells(meta: &SeriesMeta, cells: &[f64], timestamp: f64) -> Result<Self> {
        if cells.len() != meta.value_count() {
            return Err(FaninError::corrupt(
                meta.name.clone(),
                format!("expected {} cells, found {}", meta.value_count(), cells.len()),
            ));
        }

        match meta.kind {
            MetricKind::Counter | MetricKind::Gauge => Ok(Self::Scalar {
                value: cells[0],
                timestamp,
            }),
            MetricKind::Histogram => {
                let bucket_cells = meta.buckets.len() + 1;
                let cumulative = cells[..bucket_cells].to_vec();
                if cumulative.windows(2).any(|pair| pair[1] < pair[0]) {
                    return Err(FaninError::corrupt(
                        meta.name.clone(),
                        "cumulative bucket counts decrease",
                    ));
                }
                Ok(Self::Histogram {
                    cumulative,
                    sum: cells[bucket_cells],
                    count: cells[bucket_cells + 1],
                    timestamp,
                })
            }
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            Self::Scalar { timestamp, .. } | Self::Histogram { timestamp, .. } => *timestamp,
        }
    }
}

/// The writer of a storage region: a pid plus the OS start time of that pid,
/// so a recycled pid never inherits a dead process's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub started_at: u64,
}

impl ProcessRecord {
    /// Start time recorded when the OS would not report one; liveness then
    /// falls back to pid presence alone.
    pub const UNKNOWN_START: u64 = 0;

    pub fn new(pid: u32, started_at: u64) -> Self {
        Self { pid, started_at }
    }

    pub fn token(&self) -> String {
        format!("{}-{}", self.pid, self.started_at)
    }

    pub fn parse_token(token: &str) -> Option<Self> {
        let (pid, started_at) = token.split_once('-')?;
        Some(Self {
            pid: pid.parse().ok()?,
            started_at: started_at.parse().ok()?,
        })
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} (started {})", self.pid, self.started_at)
    }
}

/// Validates histogram bounds: finite, strictly increasing after sorting.
/// A trailing `+Inf` is accepted and dropped since it is always implicit.
pub fn normalize_buckets(buckets: &[f64]) -> Result<Vec<f64>> {
    let mut bounds = buckets
        .iter()
        .copied()
        .filter(|bound| *bound != f64::INFINITY)
        .collect::<Vec<_>>();

    if bounds.iter().any(|bound| !bound.is_finite()) {
        return Err(FaninError::InvalidArgument(
            "histogram buckets must be finite numbers".to_string(),
        ));
    }

    bounds.sort_by(|left, right| left.total_cmp(right));
    if bounds.windows(2).any(|pair| pair[0] == pair[1]) {
        return Err(FaninError::InvalidArgument(
            "histogram buckets must be unique".to_string(),
        ));
    }

    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram_meta() -> SeriesMeta {
        SeriesMeta {
            name: "request_duration_seconds".to_string(),
            kind: MetricKind::Histogram,
            gauge_mode: None,
            label_names: vec!["method".to_string()],
            label_values: vec!["GET".to_string()],
            buckets: vec![0.1, 0.25, 0.5],
        }
    }

    #[test]
    fn series_hash_depends_on_label_values() {
        let first = histogram_meta();
        let mut second = histogram_meta();
        second.label_values = vec!["POST".to_string()];

        let first_hash = first.series_hash().ok();
        assert_eq!(first_hash, histogram_meta().series_hash().ok());
        assert_ne!(first_hash, second.series_hash().ok());
        assert_eq!(first_hash.map(|hash| hash.len()), Some(32));
    }

    #[test]
    fn histogram_cells_round_trip_through_sample() {
        let meta = histogram_meta();
        assert_eq!(meta.value_count(), 6);

        let sample = SampleValue::from_cells(&meta, &[0.0, 1.0, 2.0, 2.0, 0.7, 2.0], 5.0);
        match sample {
            Ok(SampleValue::Histogram {
                cumulative,
                sum,
                count,
                timestamp,
            }) => {
                assert_eq!(cumulative, vec![0.0, 1.0, 2.0, 2.0]);
                assert_eq!(sum, 0.7);
                assert_eq!(count, 2.0);
                assert_eq!(timestamp, 5.0);
            }
            other => panic!("unexpected sample: {other:?}"),
        }
    }

    #[test]
    fn decreasing_cumulative_counts_are_corrupt() {
        let meta = histogram_meta();
        let sample = SampleValue::from_cells(&meta, &[3.0, 1.0, 2.0, 2.0, 0.7, 2.0], 5.0);
        assert!(matches!(sample, Err(FaninError::CorruptRecord { .. })));
    }

    #[test]
    fn process_token_round_trips() {
        let record = ProcessRecord::new(4242, 1_700_000_000);
        assert_eq!(record.token(), "4242-1700000000");
        assert_eq!(ProcessRecord::parse_token(&record.token()), Some(record));
        assert_eq!(ProcessRecord::parse_token("4242"), None);
        assert_eq!(ProcessRecord::parse_token("abc-1"), None);
    }

    #[test]
    fn normalize_buckets_sorts_and_drops_inf() {
        let buckets = normalize_buckets(&[0.5, 0.1, 0.25, f64::INFINITY]).ok();
        assert_eq!(buckets, Some(vec![0.1, 0.25, 0.5]));
        assert!(normalize_buckets(&[0.1, 0.1]).is_err());
        assert!(normalize_buckets(&[f64::NAN]).is_err());
    }
}
