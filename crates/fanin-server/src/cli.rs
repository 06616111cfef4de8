use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use fanin_common::error::Result;
use fanin_metrics::{CollectorConfig, StalePolicy};
use fanin_storage::{FileConfig, RedisConfig, StoreConfig};

#[derive(Parser)]
#[command(name = "fanin", about = "Multiprocess metrics aggregation")]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, env = "FANIN_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the aggregated view of every process's metrics.
    Exporter(ExporterArgs),
    /// Run an instrumented demo worker that writes metrics.
    Worker(WorkerArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    File,
    Redis,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StalePolicyArg {
    Exclude,
    UntilReclaimed,
}

impl From<StalePolicyArg> for StalePolicy {
    fn from(value: StalePolicyArg) -> Self {
        match value {
            StalePolicyArg::Exclude => StalePolicy::Exclude,
            StalePolicyArg::UntilReclaimed => StalePolicy::UntilReclaimed,
        }
    }
}

#[derive(Args, Debug)]
pub struct StorageArgs {
    #[arg(long, env = "FANIN_BACKEND", value_enum, default_value = "file")]
    pub backend: BackendArg,

    #[arg(long, env = "FANIN_DATA_DIR", default_value = "./fanin-data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "FANIN_REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    #[arg(long, env = "FANIN_REDIS_PORT", default_value = "6379")]
    pub redis_port: u16,

    #[arg(long, env = "FANIN_REDIS_DB", default_value = "0")]
    pub redis_db: i64,

    #[arg(long, env = "FANIN_REDIS_PASSWORD", hide_env_values = true)]
    pub redis_password: Option<String>,

    #[arg(long, env = "FANIN_KEY_PREFIX", default_value = "fanin")]
    pub key_prefix: String,

    /// Key expiry in seconds; 0 keeps keys until explicitly deleted.
    #[arg(long, env = "FANIN_REDIS_TTL_SECS", default_value = "300")]
    pub redis_ttl_secs: u64,

    #[arg(long, env = "FANIN_REDIS_OP_TIMEOUT_MS", default_value = "2000")]
    pub redis_op_timeout_ms: u64,
}

impl StorageArgs {
    pub fn store_config(&self) -> Result<StoreConfig> {
        let config = match self.backend {
            BackendArg::File => StoreConfig::File(FileConfig::new(self.data_dir.clone())),
            BackendArg::Redis => StoreConfig::Redis(RedisConfig {
                host: self.redis_host.clone(),
                port: self.redis_port,
                db: self.redis_db,
                password: self.redis_password.clone(),
                key_prefix: self.key_prefix.clone(),
                ttl: (self.redis_ttl_secs > 0).then(|| Duration::from_secs(self.redis_ttl_secs)),
                op_timeout: Duration::from_millis(self.redis_op_timeout_ms),
            }),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct ExporterArgs {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "FANIN_EXPORTER_PORT", default_value = "9464")]
    pub port: u16,

    #[arg(long, env = "FANIN_SCRAPE_TIMEOUT_MS", default_value = "5000")]
    pub scrape_timeout_ms: u64,

    /// Seconds between sweeps for regions left behind by dead processes.
    #[arg(long, env = "FANIN_REAP_INTERVAL_SECS", default_value = "30")]
    pub reap_interval_secs: u64,

    /// Leave dead regions alone during scrapes; only the periodic sweep
    /// reclaims them.
    #[arg(long, env = "FANIN_NO_CLEANUP_ON_SCRAPE", default_value_t = false)]
    pub no_cleanup_on_scrape: bool,

    #[arg(long, env = "FANIN_STALE_POLICY", value_enum, default_value = "exclude")]
    pub stale_policy: StalePolicyArg,
}

impl ExporterArgs {
    pub fn collector_config(&self) -> Result<CollectorConfig> {
        let config = CollectorConfig {
            scrape_timeout: Duration::from_millis(self.scrape_timeout_ms),
            cleanup_on_scrape: !self.no_cleanup_on_scrape,
            stale_policy: self.stale_policy.into(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn reap_interval(&self) -> Option<Duration> {
        (self.reap_interval_secs > 0).then(|| Duration::from_secs(self.reap_interval_secs))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "FANIN_WORKER_PORT", default_value = "8080")]
    pub port: u16,
}

impl WorkerArgs {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_a_file_store_and_exclude_policy() {
        let cli = Cli::try_parse_from(["fanin", "exporter"]).expect("parse");
        let config = cli.storage.store_config().expect("store config");
        assert!(matches!(config, StoreConfig::File(ref file) if file.dir == PathBuf::from("./fanin-data")));

        let Command::Exporter(args) = cli.command else {
            panic!("expected exporter");
        };
        let collector = args.collector_config().expect("collector config");
        assert_eq!(collector.scrape_timeout, Duration::from_secs(5));
        assert!(collector.cleanup_on_scrape);
        assert_eq!(collector.stale_policy, StalePolicy::Exclude);
        assert_eq!(args.reap_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn redis_ttl_zero_disables_expiry() {
        let cli = Cli::try_parse_from([
            "fanin",
            "--backend",
            "redis",
            "--redis-ttl-secs",
            "0",
            "worker",
        ])
        .expect("parse");
        let StoreConfig::Redis(redis) = cli.storage.store_config().expect("store config") else {
            panic!("expected redis config");
        };
        assert_eq!(redis.ttl, None);
        assert_eq!(redis.key_prefix, "fanin");
    }

    #[test]
    fn zero_scrape_timeout_is_rejected() {
        let cli = Cli::try_parse_from(["fanin", "exporter", "--scrape-timeout-ms", "0"])
            .expect("parse");
        let Command::Exporter(args) = cli.command else {
            panic!("expected exporter");
        };
        assert!(args.collector_config().is_err());
    }
}
