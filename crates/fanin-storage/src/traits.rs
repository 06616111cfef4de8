use async_trait::async_trait;
use fanin_common::error::Result;
use fanin_common::types::{ProcessRecord, SampleValue, SeriesMeta};

use crate::liveness::ProcessTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    File,
    Redis,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Redis => "redis",
        }
    }
}

/// A single mutation issued by a value handle against its own series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteOp {
    Add(f64),
    Set(f64),
    /// A histogram observation; `bucket` indexes the first bound >= `value`.
    Observe { bucket: usize, value: f64 },
}

impl WriteOp {
    /// Applies the operation to the flat cell layout of `SeriesMeta::value_count`.
    pub fn apply(&self, cells: &mut [f64]) {
        match *self {
            Self::Add(delta) => {
                if let Some(cell) = cells.first_mut() {
                    *cell += delta;
                }
            }
            Self::Set(value) => {
                if let Some(cell) = cells.first_mut() {
                    *cell = value;
                }
            }
            Self::Observe { bucket, value } => {
                let bucket_cells = cells.len().saturating_sub(2);
                for cell in cells.iter_mut().take(bucket_cells).skip(bucket) {
                    *cell += 1.0;
                }
                if let Some(sum) = cells.get_mut(bucket_cells) {
                    *sum += value;
                }
                if let Some(count) = cells.get_mut(bucket_cells + 1) {
                    *count += 1.0;
                }
            }
        }
    }
}

/// One process's current value for one series, as found during a scan.
#[derive(Debug, Clone)]
pub struct ProcessSample {
    pub process: ProcessRecord,
    pub meta: SeriesMeta,
    pub value: SampleValue,
    pub live: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StoreScan {
    pub samples: Vec<ProcessSample>,
    /// Owners whose data was found but who are no longer running.
    pub stale: Vec<ProcessRecord>,
    /// Regions or entries that could not be decoded and were skipped.
    pub corrupt: usize,
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// The process this store writes on behalf of.
    fn process(&self) -> ProcessRecord;

    /// Confirms the backend is reachable right now.
    async fn ping(&self) -> Result<()>;

    async fn write(&self, meta: &SeriesMeta, op: WriteOp) -> Result<()>;

    async fn scan(&self, processes: &dyn ProcessTable) -> Result<StoreScan>;

    async fn stale_processes(&self, processes: &dyn ProcessTable) -> Result<Vec<ProcessRecord>>;

    /// Removes everything `process` has written. Returns the number of
    /// regions or keys deleted.
    async fn purge(&self, process: &ProcessRecord) -> Result<usize>;

    /// Graceful-shutdown hook: drops this process's own contribution.
    async fn release(&self) -> Result<usize> {
        let process = self.process();
        self.purge(&process).await
    }
}
