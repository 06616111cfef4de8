use std::collections::{BTreeSet, HashMap};
use std::future::Future;

use async_trait::async_trait;
use fanin_common::error::{FaninError, Result};
use fanin_common::time;
use fanin_common::types::{MetricKind, ProcessRecord, SampleValue, SeriesMeta};
use redis::RedisResult;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::keys::{
    COUNT_FIELD, KeyScheme, SUM_FIELD, TIMESTAMP_FIELD, VALUE_FIELD, bucket_field,
};
use crate::config::RedisConfig;
use crate::liveness::ProcessTable;
use crate::traits::{MetricStore, ProcessSample, StoreKind, StoreScan, WriteOp};

const SCAN_BATCH: usize = 500;
const FETCH_BATCH: usize = 200;

/// Redis backend: per-process key namespaces kept alive by a sliding TTL.
pub struct RedisStore {
    config: RedisConfig,
    keys: KeyScheme,
    process: ProcessRecord,
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Builds the client without touching the network; the connection is
    /// established on first use and re-established after failures.
    pub fn new(config: RedisConfig, process: ProcessRecord) -> Result<Self> {
        config.validate()?;
        let client = redis::Client::open(config.connection_url()).map_err(|err| {
            FaninError::InvalidArgument(format!("invalid redis connection settings: {err}"))
        })?;

        Ok(Self {
            keys: KeyScheme::new(config.key_prefix.clone()),
            config,
            process,
            client,
            connection: Mutex::new(None),
        })
    }

    pub fn keys(&self) -> &KeyScheme {
        &self.keys
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .bounded("connect", ConnectionManager::new(self.client.clone()))
            .await?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            db = self.config.db,
            "connected to redis metrics store"
        );
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.config.op_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(FaninError::StorageUnavailable(format!(
                "redis {what} failed: {err}"
            ))),
            Err(_) => Err(FaninError::StorageUnavailable(format!(
                "redis {what} timed out after {:?}",
                self.config.op_timeout
            ))),
        }
    }

    async fn scan_keys(&self, conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = 0u64;
        let mut keys = BTreeSet::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "scan",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys.into_iter().collect())
    }

    fn decode_sample(
        &self,
        meta_key: &str,
        meta_json: Option<String>,
        fields: HashMap<String, String>,
    ) -> Result<Option<(SeriesMeta, SampleValue)>> {
        // expired between SCAN and fetch
        let Some(meta_json) = meta_json else {
            return Ok(None);
        };
        if fields.is_empty() {
            return Ok(None);
        }

        let meta: SeriesMeta = serde_json::from_str(&meta_json)
            .map_err(|err| FaninError::corrupt(meta_key, format!("unreadable metadata: {err}")))?;

        let field = |name: &str| -> Result<f64> {
            match fields.get(name) {
                Some(raw) => raw.parse::<f64>().map_err(|_| {
                    FaninError::corrupt(meta_key, format!("field {name} is not a number: {raw}"))
                }),
                None => Ok(0.0),
            }
        };

        let cells = match meta.kind {
            MetricKind::Counter | MetricKind::Gauge => vec![field(VALUE_FIELD)?],
            MetricKind::Histogram => {
                let mut cells = Vec::with_capacity(meta.value_count());
                for index in 0..=meta.buckets.len() {
                    cells.push(field(&bucket_field(index))?);
                }
                cells.push(field(SUM_FIELD)?);
                cells.push(field(COUNT_FIELD)?);
                cells
            }
        };

        let value = SampleValue::from_cells(&meta, &cells, field(TIMESTAMP_FIELD)?)?;
        Ok(Some((meta, value)))
    }
}

#[async_trait]
impl MetricStore for RedisStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Redis
    }

    fn process(&self) -> ProcessRecord {
        self.process
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .bounded("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn write(&self, meta: &SeriesMeta, op: WriteOp) -> Result<()> {
        let series_hash = meta.series_hash()?;
        let metric_key = self.keys.metric_key(&self.process, &series_hash);
        let meta_key = self.keys.meta_key(&self.process, &series_hash);
        let meta_json = meta.canonical()?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        match op {
            WriteOp::Add(delta) => {
                pipe.cmd("HINCRBYFLOAT")
                    .arg(&metric_key)
                    .arg(VALUE_FIELD)
                    .arg(delta)
                    .ignore();
            }
            WriteOp::Set(value) => {
                pipe.cmd("HSET")
                    .arg(&metric_key)
                    .arg(VALUE_FIELD)
                    .arg(value)
                    .ignore();
            }
            WriteOp::Observe { bucket, value } => {
                for index in bucket..=meta.buckets.len() {
                    pipe.cmd("HINCRBYFLOAT")
                        .arg(&metric_key)
                        .arg(bucket_field(index))
                        .arg(1)
                        .ignore();
                }
                pipe.cmd("HINCRBYFLOAT")
                    .arg(&metric_key)
                    .arg(SUM_FIELD)
                    .arg(value)
                    .ignore();
                pipe.cmd("HINCRBYFLOAT")
                    .arg(&metric_key)
                    .arg(COUNT_FIELD)
                    .arg(1)
                    .ignore();
            }
        }
        pipe.cmd("HSET")
            .arg(&metric_key)
            .arg(TIMESTAMP_FIELD)
            .arg(time::now_unix_seconds())
            .ignore();

        match self.config.ttl_seconds() {
            Some(ttl) => {
                pipe.cmd("EXPIRE").arg(&metric_key).arg(ttl).ignore();
                pipe.cmd("SET")
                    .arg(&meta_key)
                    .arg(&meta_json)
                    .arg("EX")
                    .arg(ttl)
                    .ignore();
            }
            None => {
                pipe.cmd("SET").arg(&meta_key).arg(&meta_json).ignore();
            }
        }

        let mut conn = self.connection().await?;
        let _: () = self.bounded("write", pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn scan(&self, _processes: &dyn ProcessTable) -> Result<StoreScan> {
        let mut conn = self.connection().await?;
        let meta_keys = self.scan_keys(&mut conn, &self.keys.meta_pattern()).await?;
        let mut scan = StoreScan::default();

        let parsed = meta_keys
            .iter()
            .filter_map(|key| {
                let parsed = self.keys.parse_meta_key(key);
                if parsed.is_none() {
                    debug!(key = %key, "ignoring foreign key under metrics prefix");
                }
                parsed.map(|(process, hash)| (key.as_str(), process, hash))
            })
            .collect::<Vec<_>>();

        for batch in parsed.chunks(FETCH_BATCH) {
            let batch_meta_keys = batch.iter().map(|(key, _, _)| *key).collect::<Vec<_>>();
            let metas: Vec<Option<String>> = self
                .bounded(
                    "mget",
                    redis::cmd("MGET").arg(batch_meta_keys).query_async(&mut conn),
                )
                .await?;

            let mut fetch = redis::pipe();
            for (_, process, hash) in batch {
                fetch.cmd("HGETALL").arg(self.keys.metric_key(process, hash));
            }
            let values: Vec<HashMap<String, String>> = self
                .bounded("hgetall", fetch.query_async(&mut conn))
                .await?;

            for (((meta_key, process, _), meta_json), fields) in
                batch.iter().zip(metas).zip(values)
            {
                match self.decode_sample(meta_key, meta_json, fields) {
                    Ok(Some((meta, value))) => scan.samples.push(ProcessSample {
                        process: *process,
                        meta,
                        value,
                        // presence within the TTL window is what liveness means here
                        live: true,
                    }),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(key = %meta_key, error = %err, "skipping corrupt redis entry");
                        scan.corrupt += 1;
                    }
                }
            }
        }

        Ok(scan)
    }

    async fn stale_processes(&self, _processes: &dyn ProcessTable) -> Result<Vec<ProcessRecord>> {
        // expiry reclaims dead namespaces on the server side
        Ok(Vec::new())
    }

    async fn purge(&self, process: &ProcessRecord) -> Result<usize> {
        let mut conn = self.connection().await?;
        let keys = self
            .scan_keys(&mut conn, &self.keys.process_pattern(process))
            .await?;

        let mut deleted = 0usize;
        for batch in keys.chunks(SCAN_BATCH) {
            let removed: usize = self
                .bounded("del", redis::cmd("DEL").arg(batch.to_vec()).query_async(&mut conn))
                .await?;
            deleted += removed;
        }

        info!(process = %process, deleted, "removed redis metrics namespace");
        Ok(deleted)
    }
}
