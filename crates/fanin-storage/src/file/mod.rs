pub mod region;
pub mod storage;

pub use storage::FileStore;
