pub mod backend;
pub mod cleanup;
pub mod config;
pub mod file;
pub mod liveness;
#[cfg(feature = "redis")]
pub mod remote;
pub mod traits;

pub use backend::BackendRegistry;
pub use config::{FileConfig, RedisConfig, StoreConfig};
pub use liveness::{ProcessTable, StaticProcessTable, SystemProcessTable, current_process};
pub use traits::{MetricStore, ProcessSample, StoreKind, StoreScan, WriteOp};
