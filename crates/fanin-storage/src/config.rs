use std::path::PathBuf;
use std::time::Duration;

use fanin_common::error::{FaninError, Result};

use crate::traits::StoreKind;

pub const DEFAULT_KEY_PREFIX: &str = "fanin";
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum StoreConfig {
    File(FileConfig),
    Redis(RedisConfig),
}

impl StoreConfig {
    pub fn kind(&self) -> StoreKind {
        match self {
            Self::File(_) => StoreKind::File,
            Self::Redis(_) => StoreKind::Redis,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::File(config) => config.validate(),
            Self::Redis(config) => config.validate(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileConfig {
    pub dir: PathBuf,
}

impl FileConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(FaninError::InvalidArgument(
                "file storage requires a directory".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub key_prefix: String,
    /// Sliding expiry refreshed on every write; `None` keeps keys until they
    /// are deleted explicitly.
    pub ttl: Option<Duration>,
    /// Upper bound for every Redis round trip.
    pub op_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: Some(DEFAULT_TTL),
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(FaninError::InvalidArgument("redis host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(FaninError::InvalidArgument("redis port must be non-zero".to_string()));
        }
        if self.db < 0 {
            return Err(FaninError::InvalidArgument(format!(
                "redis db index must be non-negative, got {}",
                self.db
            )));
        }
        if self.key_prefix.is_empty()
            || self
                .key_prefix
                .chars()
                .any(|ch| ch.is_whitespace() || matches!(ch, ':' | '*' | '?' | '[' | ']' | '\\'))
        {
            return Err(FaninError::InvalidArgument(format!(
                "invalid redis key prefix: {:?}",
                self.key_prefix
            )));
        }
        if self.ttl.is_some_and(|ttl| ttl.as_secs() == 0) {
            return Err(FaninError::InvalidArgument(
                "redis ttl must be at least one second".to_string(),
            ));
        }
        if self.op_timeout.is_zero() {
            return Err(FaninError::InvalidArgument(
                "redis operation timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ttl_seconds(&self) -> Option<u64> {
        self.ttl.map(|ttl| ttl.as_secs())
    }

    #[cfg(feature = "redis")]
    pub fn connection_url(&self) -> String {
        use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

        let auth = match self.password.as_deref() {
            Some(password) if !password.is_empty() => {
                format!(":{}@", utf8_percent_encode(password, NON_ALPHANUMERIC))
            }
            _ => String::new(),
        };
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_redis_config_is_valid() {
        assert!(RedisConfig::default().validate().is_ok());
        assert_eq!(RedisConfig::default().ttl_seconds(), Some(300));
    }

    #[test]
    fn rejects_prefix_with_separator_or_glob() {
        for prefix in ["", "a:b", "metrics*", "has space"] {
            let config = RedisConfig {
                key_prefix: prefix.to_string(),
                ..RedisConfig::default()
            };
            assert!(config.validate().is_err(), "prefix {prefix:?} accepted");
        }
    }

    #[test]
    fn rejects_zero_ttl_but_allows_disabled_ttl() {
        let zero = RedisConfig {
            ttl: Some(Duration::ZERO),
            ..RedisConfig::default()
        };
        assert!(zero.validate().is_err());

        let disabled = RedisConfig {
            ttl: None,
            ..RedisConfig::default()
        };
        assert!(disabled.validate().is_ok());
        assert_eq!(disabled.ttl_seconds(), None);
    }

    #[test]
    fn file_config_requires_directory() {
        assert!(StoreConfig::File(FileConfig::new("")).validate().is_err());
        assert!(StoreConfig::File(FileConfig::new("/tmp/fanin")).validate().is_ok());
    }

    #[cfg(feature = "redis")]
    #[test]
    fn connection_url_escapes_password() {
        let config = RedisConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            db: 2,
            password: Some("p@ss:word".to_string()),
            ..RedisConfig::default()
        };
        assert_eq!(
            config.connection_url(),
            "redis://:p%40ss%3Aword@cache.internal:6380/2"
        );
        assert_eq!(
            RedisConfig::default().connection_url(),
            "redis://127.0.0.1:6379/0"
        );
    }
}
