use fanin_common::types::{GaugeMode, MetricKind, SampleValue, SeriesMeta};
use fanin_storage::traits::ProcessSample;

use crate::collector::StalePolicy;
use crate::types::MetricValue;

/// Whether a process's sample takes part in the reduction of a series.
pub fn contributes(meta: &SeriesMeta, sample: &ProcessSample, policy: StalePolicy) -> bool {
    if sample.live {
        return true;
    }
    if meta.kind == MetricKind::Gauge && meta.gauge_mode() == GaugeMode::LiveSum {
        return false;
    }
    policy == StalePolicy::UntilReclaimed
}

/// Reduces the per-process samples of one series into a single value.
///
/// `samples` must share `meta`'s shape and be ordered by process so that
/// timestamp ties under `MostRecent` resolve the same way on every scrape.
/// Returns `None` when no sample contributes.
pub fn reduce(
    meta: &SeriesMeta,
    samples: &[ProcessSample],
    policy: StalePolicy,
) -> Option<MetricValue> {
    let contributing = samples
        .iter()
        .filter(|sample| contributes(meta, sample, policy))
        .collect::<Vec<_>>();
    if contributing.is_empty() {
        return None;
    }

    match meta.kind {
        MetricKind::Counter => Some(MetricValue::Counter(
            scalars(&contributing).map(|(value, _)| value).sum(),
        )),
        MetricKind::Gauge => reduce_gauge(meta.gauge_mode(), &contributing).map(MetricValue::Gauge),
        MetricKind::Histogram => Some(reduce_histogram(meta, &contributing)),
    }
}

fn scalars<'a>(samples: &'a [&'a ProcessSample]) -> impl Iterator<Item = (f64, f64)> + 'a {
    samples.iter().filter_map(|sample| match sample.value {
        SampleValue::Scalar { value, timestamp } => Some((value, timestamp)),
        SampleValue::Histogram { .. } => None,
    })
}

fn reduce_gauge(mode: GaugeMode, samples: &[&ProcessSample]) -> Option<f64> {
    let mut values = scalars(samples).peekable();
    values.peek()?;

    let reduced = match mode {
        GaugeMode::Sum | GaugeMode::LiveSum => values.map(|(value, _)| value).sum(),
        GaugeMode::Max => values
            .map(|(value, _)| value)
            .fold(f64::NEG_INFINITY, f64::max),
        GaugeMode::Min => values.map(|(value, _)| value).fold(f64::INFINITY, f64::min),
        // later processes win ties
        GaugeMode::MostRecent => values
            .fold(None::<(f64, f64)>, |latest, (value, timestamp)| match latest {
                Some((_, latest_ts)) if latest_ts > timestamp => latest,
                _ => Some((value, timestamp)),
            })
            .map(|(value, _)| value)?,
    };
    Some(reduced)
}

fn reduce_histogram(meta: &SeriesMeta, samples: &[&ProcessSample]) -> MetricValue {
    let bounds = meta.bucket_bounds();
    let mut cumulative = vec![0.0_f64; bounds.len()];
    let mut sum = 0.0_f64;
    let mut count = 0.0_f64;

    for sample in samples {
        if let SampleValue::Histogram {
            cumulative: counts,
            sum: sample_sum,
            count: sample_count,
            ..
        } = &sample.value
        {
            // element-wise sums of non-decreasing sequences stay non-decreasing
            for (total, value) in cumulative.iter_mut().zip(counts) {
                *total += *value;
            }
            sum += *sample_sum;
            count += *sample_count;
        }
    }

    MetricValue::Histogram {
        buckets: bounds
            .into_iter()
            .zip(cumulative)
            .map(|(bound, total)| (bound, as_count(total)))
            .collect(),
        count: as_count(count),
        sum,
    }
}

fn as_count(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}
