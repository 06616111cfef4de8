use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use fanin_common::error::{FaninError, Result};
use fanin_common::types::{GaugeMode, MetricKind};
use fanin_storage::traits::MetricStore;

use crate::handle::ValueHandle;
use crate::types::MetricDescriptor;

type LabelValues = Vec<String>;

/// Per-process metric registry, owned by the composition root and shared with
/// instrumentation call sites and the collector.
pub struct MetricsRegistry {
    store: Arc<dyn MetricStore>,
    metrics: RwLock<HashMap<String, Arc<Metric>>>,
}

impl MetricsRegistry {
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Self {
            store,
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn MetricStore> {
        Arc::clone(&self.store)
    }

    /// Idempotent registration with default help, gauge mode and buckets.
    pub fn get_or_create(
        &self,
        name: &str,
        kind: MetricKind,
        variable_labels: &[&str],
    ) -> Result<Arc<Metric>> {
        self.register(MetricDescriptor::new(
            name,
            "",
            kind,
            variable_labels,
            GaugeMode::default(),
            &[],
        )?)
    }

    pub fn counter(&self, name: &str, help: &str, variable_labels: &[&str]) -> Result<Arc<Metric>> {
        self.register(MetricDescriptor::new(
            name,
            help,
            MetricKind::Counter,
            variable_labels,
            GaugeMode::Sum,
            &[],
        )?)
    }

    pub fn gauge(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
        mode: GaugeMode,
    ) -> Result<Arc<Metric>> {
        self.register(MetricDescriptor::new(
            name,
            help,
            MetricKind::Gauge,
            variable_labels,
            mode,
            &[],
        )?)
    }

    pub fn histogram(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
        buckets: &[f64],
    ) -> Result<Arc<Metric>> {
        self.register(MetricDescriptor::new(
            name,
            help,
            MetricKind::Histogram,
            variable_labels,
            GaugeMode::Sum,
            buckets,
        )?)
    }

    /// Returns the existing metric when an identical shape is already
    /// registered; a different shape under the same name is rejected.
    pub fn register(&self, descriptor: MetricDescriptor) -> Result<Arc<Metric>> {
        let mut metrics = self.metrics.write().map_err(|_| {
            FaninError::InternalError("failed to acquire metrics registry lock".to_string())
        })?;

        if let Some(existing) = metrics.get(&descriptor.name) {
            if existing.descriptor.same_shape(&descriptor) {
                return Ok(Arc::clone(existing));
            }
            return Err(FaninError::InvalidArgument(format!(
                "metric already registered with a different shape: {}",
                descriptor.name
            )));
        }

        let metric = Arc::new(Metric {
            descriptor: descriptor.clone(),
            store: Arc::clone(&self.store),
            series: RwLock::new(HashMap::new()),
        });
        metrics.insert(descriptor.name, Arc::clone(&metric));
        Ok(metric)
    }

    pub fn descriptors(&self) -> Vec<MetricDescriptor> {
        let metrics = match self.metrics.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        let mut descriptors = metrics
            .values()
            .map(|metric| metric.descriptor.clone())
            .collect::<Vec<_>>();
        descriptors.sort_by(|left, right| left.name.cmp(&right.name));
        descriptors
    }
}

pub struct Metric {
    descriptor: MetricDescriptor,
    store: Arc<dyn MetricStore>,
    series: RwLock<HashMap<LabelValues, ValueHandle>>,
}

impl Metric {
    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    /// Handle for one label set; repeated calls share one storage slot.
    pub fn with_labels(&self, label_values: &[&str]) -> Result<ValueHandle> {
        let expected = self.descriptor.variable_labels.len();
        if label_values.len() != expected {
            return Err(FaninError::InvalidArgument(format!(
                "{} expects {expected} label values, got {}",
                self.descriptor.name,
                label_values.len()
            )));
        }

        let label_values = label_values
            .iter()
            .map(|value| (*value).to_string())
            .collect::<LabelValues>();

        if let Ok(guard) = self.series.read()
            && let Some(existing) = guard.get(&label_values)
        {
            return Ok(existing.clone());
        }

        let mut guard = self.series.write().map_err(|_| {
            FaninError::InternalError("failed to acquire metric series lock".to_string())
        })?;
        let handle = guard
            .entry(label_values.clone())
            .or_insert_with(|| {
                ValueHandle::new(
                    self.descriptor.series_meta(label_values),
                    Arc::clone(&self.store),
                )
            })
            .clone();
        Ok(handle)
    }
}
