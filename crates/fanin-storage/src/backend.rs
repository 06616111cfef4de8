use std::collections::HashMap;
use std::sync::Arc;

use fanin_common::error::{FaninError, Result};
use fanin_common::types::ProcessRecord;
use futures::future::BoxFuture;
use tracing::info;

use crate::config::StoreConfig;
use crate::file::FileStore;
use crate::traits::{MetricStore, StoreKind};

type StoreFactory =
    fn(&StoreConfig, ProcessRecord) -> BoxFuture<'_, Result<Arc<dyn MetricStore>>>;

/// Storage backends compiled into this build, resolved once at startup.
///
/// The Redis factory only exists when the `redis` feature is enabled; asking
/// for it otherwise is an `Unsupported` error rather than a late failure.
pub struct BackendRegistry {
    factories: HashMap<StoreKind, StoreFactory>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_available_backends() -> Self {
        let mut registry = Self::empty();
        registry.register(StoreKind::File, open_file_store);
        #[cfg(feature = "redis")]
        registry.register(StoreKind::Redis, open_redis_store);
        registry
    }

    pub fn register(&mut self, kind: StoreKind, factory: StoreFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn supports(&self, kind: StoreKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub async fn open(
        &self,
        config: &StoreConfig,
        process: ProcessRecord,
    ) -> Result<Arc<dyn MetricStore>> {
        config.validate()?;
        let kind = config.kind();
        let factory = self.factories.get(&kind).ok_or_else(|| {
            FaninError::Unsupported(format!(
                "storage backend {} is not available in this build",
                kind.as_str()
            ))
        })?;

        let store = factory(config, process).await?;
        info!(backend = kind.as_str(), process = %process, "metrics store opened");
        Ok(store)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_available_backends()
    }
}

fn open_file_store(
    config: &StoreConfig,
    process: ProcessRecord,
) -> BoxFuture<'_, Result<Arc<dyn MetricStore>>> {
    Box::pin(async move {
        match config {
            StoreConfig::File(file) => {
                let store = FileStore::new(file.dir.clone(), process).await?;
                Ok(Arc::new(store) as Arc<dyn MetricStore>)
            }
            other => Err(FaninError::InternalError(format!(
                "file factory invoked for {} config",
                other.kind().as_str()
            ))),
        }
    })
}

#[cfg(feature = "redis")]
fn open_redis_store(
    config: &StoreConfig,
    process: ProcessRecord,
) -> BoxFuture<'_, Result<Arc<dyn MetricStore>>> {
    Box::pin(async move {
        match config {
            StoreConfig::Redis(redis) => {
                let store = crate::remote::RedisStore::new(redis.clone(), process)?;
                Ok(Arc::new(store) as Arc<dyn MetricStore>)
            }
            other => Err(FaninError::InternalError(format!(
                "redis factory invoked for {} config",
                other.kind().as_str()
            ))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, RedisConfig};

    #[tokio::test]
    async fn opens_file_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = BackendRegistry::with_available_backends();
        let store = registry
            .open(
                &StoreConfig::File(FileConfig::new(dir.path())),
                ProcessRecord::new(1, 1),
            )
            .await
            .expect("open");
        assert_eq!(store.kind(), StoreKind::File);
    }

    #[tokio::test]
    async fn missing_backend_is_unsupported() {
        let registry = BackendRegistry::empty();
        let result = registry
            .open(
                &StoreConfig::Redis(RedisConfig::default()),
                ProcessRecord::new(1, 1),
            )
            .await;
        assert!(matches!(result, Err(FaninError::Unsupported(_))));
    }

    #[test]
    fn redis_support_follows_feature() {
        let registry = BackendRegistry::with_available_backends();
        assert!(registry.supports(StoreKind::File));
        assert_eq!(registry.supports(StoreKind::Redis), cfg!(feature = "redis"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_opening() {
        let registry = BackendRegistry::with_available_backends();
        let result = registry
            .open(&StoreConfig::File(FileConfig::new("")), ProcessRecord::new(1, 1))
            .await;
        assert!(matches!(result, Err(FaninError::InvalidArgument(_))));
    }
}
