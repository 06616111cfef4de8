pub mod error;
pub mod time;
pub mod types;

pub use error::{FaninError, Result};
pub use types::{GaugeMode, MetricKind, ProcessRecord, SampleValue, SeriesKey, SeriesMeta};
