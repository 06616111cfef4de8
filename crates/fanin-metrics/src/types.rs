use fanin_common::error::{FaninError, Result};
use fanin_common::types::{GaugeMode, MetricKind, SeriesKey, SeriesMeta, normalize_buckets};

pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub metric_type: MetricKind,
    pub variable_labels: Vec<String>,
    /// Only meaningful for gauges; counters and histograms always sum.
    pub gauge_mode: GaugeMode,
    /// Finite histogram bounds, sorted; `+Inf` is implicit.
    pub buckets: Vec<f64>,
}

impl MetricDescriptor {
    pub fn new(
        name: &str,
        help: &str,
        metric_type: MetricKind,
        variable_labels: &[&str],
        gauge_mode: GaugeMode,
        buckets: &[f64],
    ) -> Result<Self> {
        validate_metric_name(name)?;
        let variable_labels = variable_labels
            .iter()
            .map(|label| (*label).to_string())
            .collect::<Vec<_>>();
        validate_label_names(metric_type, &variable_labels)?;

        let buckets = match metric_type {
            MetricKind::Histogram if buckets.is_empty() => DEFAULT_BUCKETS.to_vec(),
            MetricKind::Histogram => normalize_buckets(buckets)?,
            MetricKind::Counter | MetricKind::Gauge => Vec::new(),
        };

        let gauge_mode = match metric_type {
            MetricKind::Gauge => gauge_mode,
            MetricKind::Counter | MetricKind::Histogram => GaugeMode::Sum,
        };

        Ok(Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type,
            variable_labels,
            gauge_mode,
            buckets,
        })
    }

    /// Rebuilds a descriptor from persisted metadata for metrics this process
    /// never registered.
    pub fn from_series(meta: &SeriesMeta) -> Self {
        Self {
            name: meta.name.clone(),
            help: String::new(),
            metric_type: meta.kind,
            variable_labels: meta.label_names.clone(),
            gauge_mode: meta.gauge_mode(),
            buckets: meta.buckets.clone(),
        }
    }

    pub fn series_meta(&self, label_values: Vec<String>) -> SeriesMeta {
        SeriesMeta {
            name: self.name.clone(),
            kind: self.metric_type,
            gauge_mode: (self.metric_type == MetricKind::Gauge).then_some(self.gauge_mode),
            label_names: self.variable_labels.clone(),
            label_values,
            buckets: self.buckets.clone(),
        }
    }

    /// Same metric shape, ignoring help text.
    pub fn same_shape(&self, other: &MetricDescriptor) -> bool {
        self.name == other.name
            && self.metric_type == other.metric_type
            && self.variable_labels == other.variable_labels
            && self.gauge_mode == other.gauge_mode
            && self.buckets == other.buckets
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Histogram {
        /// Cumulative counts per upper bound, ending with `+Inf`.
        buckets: Vec<(f64, u64)>,
        count: u64,
        sum: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub labels: Vec<(String, String)>,
    pub value: MetricValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectedMetric {
    pub descriptor: MetricDescriptor,
    pub samples: Vec<MetricSample>,
}

impl CollectedMetric {
    /// Flattens samples into `(series key, value)` pairs in output order.
    pub fn series(&self) -> impl Iterator<Item = (SeriesKey, &MetricValue)> + '_ {
        self.samples.iter().map(|sample| {
            (
                SeriesKey {
                    name: self.descriptor.name.clone(),
                    label_values: sample.labels.iter().map(|(_, value)| value.clone()).collect(),
                },
                &sample.value,
            )
        })
    }

    /// Looks up the sample whose label values match `label_values` positionally.
    pub fn sample(&self, label_values: &[&str]) -> Option<&MetricValue> {
        self.samples
            .iter()
            .find(|sample| {
                sample.labels.len() == label_values.len()
                    && sample
                        .labels
                        .iter()
                        .zip(label_values)
                        .all(|((_, value), expected)| value == expected)
            })
            .map(|sample| &sample.value)
    }
}

fn validate_metric_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {
            chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ':')
        }
        _ => false,
    };

    if !valid {
        return Err(FaninError::InvalidArgument(format!(
            "invalid metric name: {name:?}"
        )));
    }
    Ok(())
}

fn validate_label_names(metric_type: MetricKind, labels: &[String]) -> Result<()> {
    for (index, label) in labels.iter().enumerate() {
        let mut chars = label.chars();
        let valid = match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
            }
            _ => false,
        };
        if !valid || label.starts_with("__") {
            return Err(FaninError::InvalidArgument(format!(
                "invalid label name: {label:?}"
            )));
        }
        if metric_type == MetricKind::Histogram && label == "le" {
            return Err(FaninError::InvalidArgument(
                "histograms cannot use the reserved label \"le\"".to_string(),
            ));
        }
        if labels[..index].contains(label) {
            return Err(FaninError::InvalidArgument(format!(
                "duplicate label name: {label:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_without_buckets_gets_defaults() {
        let descriptor = MetricDescriptor::new(
            "latency_seconds",
            "latency",
            MetricKind::Histogram,
            &["route"],
            GaugeMode::Max,
            &[],
        )
        .expect("descriptor");
        assert_eq!(descriptor.buckets, DEFAULT_BUCKETS.to_vec());
        // only gauges carry a mode
        assert_eq!(descriptor.gauge_mode, GaugeMode::Sum);
        assert_eq!(descriptor.series_meta(vec!["/".to_string()]).gauge_mode, None);
    }

    #[test]
    fn rejects_bad_names_and_labels() {
        let bad_name = MetricDescriptor::new("1abc", "", MetricKind::Counter, &[], GaugeMode::Sum, &[]);
        assert!(bad_name.is_err());

        let duplicate = MetricDescriptor::new(
            "requests_total",
            "",
            MetricKind::Counter,
            &["method", "method"],
            GaugeMode::Sum,
            &[],
        );
        assert!(duplicate.is_err());

        let reserved = MetricDescriptor::new(
            "latency_seconds",
            "",
            MetricKind::Histogram,
            &["le"],
            GaugeMode::Sum,
            &[],
        );
        assert!(reserved.is_err());
    }

    #[test]
    fn sample_lookup_is_positional() {
        let collected = CollectedMetric {
            descriptor: MetricDescriptor::new(
                "requests_total",
                "",
                MetricKind::Counter,
                &["method", "status"],
                GaugeMode::Sum,
                &[],
            )
            .expect("descriptor"),
            samples: vec![MetricSample {
                labels: vec![
                    ("method".to_string(), "GET".to_string()),
                    ("status".to_string(), "200".to_string()),
                ],
                value: MetricValue::Counter(3.0),
            }],
        };

        assert_eq!(collected.sample(&["GET", "200"]), Some(&MetricValue::Counter(3.0)));
        assert_eq!(collected.sample(&["200", "GET"]), None);
        let keys = collected.series().map(|(key, _)| key).collect::<Vec<_>>();
        assert_eq!(keys[0].label_values, vec!["GET".to_string(), "200".to_string()]);
    }
}
