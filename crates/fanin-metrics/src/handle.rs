use std::sync::Arc;

use fanin_common::error::{FaninError, Result};
use fanin_common::types::{MetricKind, SeriesMeta};
use fanin_storage::traits::{MetricStore, WriteOp};
use tracing::warn;

/// Write handle bound to one series of one process.
///
/// Cloning is cheap; every clone writes to the same storage slot.
#[derive(Clone)]
pub struct ValueHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    meta: SeriesMeta,
    store: Arc<dyn MetricStore>,
}

impl ValueHandle {
    pub(crate) fn new(meta: SeriesMeta, store: Arc<dyn MetricStore>) -> Self {
        Self {
            inner: Arc::new(HandleInner { meta, store }),
        }
    }

    pub fn meta(&self) -> &SeriesMeta {
        &self.inner.meta
    }

    pub fn kind(&self) -> MetricKind {
        self.inner.meta.kind
    }

    pub async fn increment(&self, delta: f64) -> Result<()> {
        match self.kind() {
            MetricKind::Counter => {
                if !delta.is_finite() || delta < 0.0 {
                    return Err(self.invalid(format!(
                        "counters only accept finite non-negative increments, got {delta}"
                    )));
                }
            }
            MetricKind::Gauge => {
                if delta.is_nan() {
                    return Err(self.invalid("gauge increment is NaN".to_string()));
                }
            }
            MetricKind::Histogram => {
                return Err(self.invalid("histograms are updated through observe".to_string()));
            }
        }
        self.apply(WriteOp::Add(delta)).await
    }

    pub async fn inc(&self) -> Result<()> {
        self.increment(1.0).await
    }

    /// Gauge-only shorthand for a negative increment.
    pub async fn decrement(&self, delta: f64) -> Result<()> {
        if self.kind() != MetricKind::Gauge {
            return Err(self.invalid("only gauges can be decremented".to_string()));
        }
        self.increment(-delta).await
    }

    pub async fn set(&self, value: f64) -> Result<()> {
        if self.kind() != MetricKind::Gauge {
            return Err(self.invalid("set is only valid on gauges".to_string()));
        }
        if value.is_nan() {
            return Err(self.invalid("gauge value is NaN".to_string()));
        }
        self.apply(WriteOp::Set(value)).await
    }

    pub async fn observe(&self, value: f64) -> Result<()> {
        if self.kind() != MetricKind::Histogram {
            return Err(self.invalid("observe is only valid on histograms".to_string()));
        }
        if value.is_nan() {
            return Err(self.invalid("observed value is NaN".to_string()));
        }

        let bucket = self
            .inner
            .meta
            .buckets
            .partition_point(|bound| *bound < value);
        self.apply(WriteOp::Observe { bucket, value }).await
    }

    async fn apply(&self, op: WriteOp) -> Result<()> {
        self.inner
            .store
            .write(&self.inner.meta, op)
            .await
            .inspect_err(|err| {
                warn!(
                    metric = %self.inner.meta.name,
                    backend = self.inner.store.kind().as_str(),
                    kind = err.kind_label(),
                    error = %err,
                    "metric write failed"
                );
            })
    }

    fn invalid(&self, reason: String) -> FaninError {
        FaninError::InvalidOperation(format!("{}: {reason}", self.inner.meta.name))
    }
}

impl std::fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueHandle")
            .field("meta", &self.inner.meta)
            .field("backend", &self.inner.store.kind())
            .finish()
    }
}
