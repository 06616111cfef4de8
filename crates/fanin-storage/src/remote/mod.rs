pub mod keys;
pub mod storage;

pub use keys::KeyScheme;
pub use storage::RedisStore;
