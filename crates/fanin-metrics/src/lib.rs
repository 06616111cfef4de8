pub mod aggregate;
pub mod collector;
pub mod handle;
pub mod recorder;
pub mod registry;
pub mod render;
pub mod types;

pub use collector::{Collector, CollectorConfig, StalePolicy};
pub use handle::ValueHandle;
pub use recorder::{MetricsRecorder, WorkerMetrics};
pub use registry::{Metric, MetricsRegistry};
pub use render::render_prometheus;
pub use types::{CollectedMetric, MetricDescriptor, MetricSample, MetricValue};
