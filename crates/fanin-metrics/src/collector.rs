use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use fanin_common::error::{FaninError, Result};
use fanin_common::types::{GaugeMode, MetricKind, SeriesMeta};
use fanin_storage::cleanup;
use fanin_storage::liveness::ProcessTable;
use fanin_storage::traits::{MetricStore, ProcessSample, StoreScan};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::aggregate;
use crate::registry::MetricsRegistry;
use crate::render::render_prometheus;
use crate::types::{CollectedMetric, MetricDescriptor, MetricSample, MetricValue};

pub const STORAGE_UP_METRIC: &str = "fanin_storage_up";
pub const CORRUPT_RECORDS_METRIC: &str = "fanin_storage_corrupt_records";

/// What a scrape does with samples whose writer is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePolicy {
    /// Dead processes contribute nothing to any mode.
    #[default]
    Exclude,
    /// Dead contributions stay until their region is reclaimed. `LiveSum`
    /// gauges still ignore them.
    UntilReclaimed,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub scrape_timeout: Duration,
    /// Reclaim regions of dead processes found while scraping.
    pub cleanup_on_scrape: bool,
    pub stale_policy: StalePolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            scrape_timeout: Duration::from_secs(5),
            cleanup_on_scrape: true,
            stale_policy: StalePolicy::Exclude,
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scrape_timeout.is_zero() {
            return Err(FaninError::InvalidArgument(
                "scrape timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Merges what every process has written into one point-in-time view.
pub struct Collector {
    stores: Vec<Arc<dyn MetricStore>>,
    processes: Arc<dyn ProcessTable>,
    registry: Option<Arc<MetricsRegistry>>,
    config: CollectorConfig,
}

struct MetricGroup {
    shape: SeriesMeta,
    series: BTreeMap<Vec<String>, Vec<ProcessSample>>,
}

impl Collector {
    pub fn new(
        stores: Vec<Arc<dyn MetricStore>>,
        processes: Arc<dyn ProcessTable>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            stores,
            processes,
            registry: None,
            config,
        }
    }

    /// Registered descriptors supply HELP text and keep declared metrics
    /// visible before any process has written to them.
    pub fn with_registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn collect(&self) -> Vec<CollectedMetric> {
        self.processes.refresh();

        let scans = join_all(self.stores.iter().map(|store| self.scan_store(store))).await;

        let mut health = Vec::with_capacity(scans.len());
        let mut samples = Vec::new();
        for (store, scan) in self.stores.iter().zip(scans) {
            match scan {
                Some(scan) => {
                    health.push((store.kind().as_str(), true, scan.corrupt));
                    if self.config.cleanup_on_scrape && !scan.stale.is_empty() {
                        self.reclaim(store.as_ref(), &scan).await;
                    }
                    samples.extend(scan.samples);
                }
                None => health.push((store.kind().as_str(), false, 0)),
            }
        }

        let mut collected = self.aggregate(samples);
        collected.extend(health_metrics(&health));
        collected.sort_by(|left, right| left.descriptor.name.cmp(&right.descriptor.name));
        collected
    }

    pub async fn render(&self) -> String {
        render_prometheus(&self.collect().await)
    }

    async fn scan_store(&self, store: &Arc<dyn MetricStore>) -> Option<StoreScan> {
        let backend = store.kind().as_str();
        match tokio::time::timeout(
            self.config.scrape_timeout,
            store.scan(self.processes.as_ref()),
        )
        .await
        {
            Ok(Ok(scan)) => {
                debug!(
                    backend,
                    samples = scan.samples.len(),
                    stale = scan.stale.len(),
                    "scanned metrics backend"
                );
                Some(scan)
            }
            Ok(Err(err)) => {
                warn!(backend, error = %err, "metrics backend scan failed");
                None
            }
            Err(_) => {
                warn!(
                    backend,
                    timeout_ms = self.config.scrape_timeout.as_millis() as u64,
                    "metrics backend scan timed out"
                );
                None
            }
        }
    }

    async fn reclaim(&self, store: &dyn MetricStore, scan: &StoreScan) {
        let reclaim = cleanup::purge_all(store, &scan.stale);
        if tokio::time::timeout(self.config.scrape_timeout, reclaim)
            .await
            .is_err()
        {
            warn!(
                backend = store.kind().as_str(),
                "reclaiming dead process metrics timed out"
            );
        }
    }

    fn aggregate(&self, mut samples: Vec<ProcessSample>) -> Vec<CollectedMetric> {
        // stable order so the first writer's shape wins a conflict
        samples.sort_by_key(|sample| sample.process);

        let declared = self
            .registry
            .as_ref()
            .map(|registry| registry.descriptors())
            .unwrap_or_default();

        let mut groups = BTreeMap::<String, MetricGroup>::new();
        let mut help = HashMap::new();
        for descriptor in &declared {
            help.insert(descriptor.name.clone(), descriptor.help.clone());
            groups.insert(
                descriptor.name.clone(),
                MetricGroup {
                    shape: descriptor.series_meta(Vec::new()),
                    series: BTreeMap::new(),
                },
            );
        }

        for sample in samples {
            let group = groups
                .entry(sample.meta.name.clone())
                .or_insert_with(|| MetricGroup {
                    shape: sample.meta.clone(),
                    series: BTreeMap::new(),
                });

            if !group.shape.same_shape(&sample.meta) {
                warn!(
                    metric = %sample.meta.name,
                    process = %sample.process,
                    "skipping series whose shape disagrees with other writers"
                );
                continue;
            }
            if sample.meta.label_values.len() != group.shape.label_names.len() {
                warn!(metric = %sample.meta.name, process = %sample.process, "skipping series with mismatched label values");
                continue;
            }

            group
                .series
                .entry(sample.meta.label_values.clone())
                .or_default()
                .push(sample);
        }

        let mut collected = Vec::with_capacity(groups.len());
        for (name, group) in groups {
            let mut descriptor = MetricDescriptor::from_series(&group.shape);
            let is_declared = match help.get(&name) {
                Some(text) => {
                    descriptor.help = text.clone();
                    true
                }
                None => false,
            };

            let metric_samples = group
                .series
                .iter()
                .filter_map(|(label_values, contributions)| {
                    let value =
                        aggregate::reduce(&group.shape, contributions, self.config.stale_policy)?;
                    Some(MetricSample {
                        labels: group
                            .shape
                            .label_names
                            .iter()
                            .cloned()
                            .zip(label_values.iter().cloned())
                            .collect(),
                        value,
                    })
                })
                .collect::<Vec<_>>();

            if metric_samples.is_empty() && !is_declared {
                continue;
            }
            collected.push(CollectedMetric {
                descriptor,
                samples: metric_samples,
            });
        }
        collected
    }
}

fn health_metrics(health: &[(&str, bool, usize)]) -> Vec<CollectedMetric> {
    let mut up = BTreeMap::<&str, bool>::new();
    let mut corrupt = BTreeMap::<&str, usize>::new();
    for &(backend, healthy, corrupt_records) in health {
        // a backend kind is up only if every store of that kind answered
        *up.entry(backend).or_insert(true) &= healthy;
        *corrupt.entry(backend).or_default() += corrupt_records;
    }

    vec![
        backend_gauge(
            STORAGE_UP_METRIC,
            "Whether the metrics backend answered the last scrape",
            up.into_iter()
                .map(|(backend, healthy)| (backend, if healthy { 1.0 } else { 0.0 }))
                .collect(),
        ),
        backend_gauge(
            CORRUPT_RECORDS_METRIC,
            "Records skipped during the last scrape because they could not be decoded",
            corrupt
                .into_iter()
                .map(|(backend, count)| (backend, count as f64))
                .collect(),
        ),
    ]
}

fn backend_gauge(name: &str, help: &str, values: Vec<(&str, f64)>) -> CollectedMetric {
    CollectedMetric {
        descriptor: MetricDescriptor {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: MetricKind::Gauge,
            variable_labels: vec!["backend".to_string()],
            gauge_mode: GaugeMode::Sum,
            buckets: Vec::new(),
        },
        samples: values
            .into_iter()
            .map(|(backend, value)| MetricSample {
                labels: vec![("backend".to_string(), backend.to_string())],
                value: MetricValue::Gauge(value),
            })
            .collect(),
    }
}
