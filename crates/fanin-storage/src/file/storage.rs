use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use fanin_common::error::{FaninError, Result};
use fanin_common::time;
use fanin_common::types::{ProcessRecord, SampleValue, SeriesMeta};
use tokio::fs;
use tracing::{debug, warn};

use super::region::{RegionWriter, decode_region, parse_region_file_name, region_file_name};
use crate::liveness::ProcessTable;
use crate::traits::{MetricStore, ProcessSample, StoreKind, StoreScan, WriteOp};

/// Reads of a region before a torn slot is reported as corrupt.
const READ_ATTEMPTS: usize = 3;

/// Shared-directory backend: one region file per writing process.
pub struct FileStore {
    root_dir: PathBuf,
    process: ProcessRecord,
    writer: Mutex<Option<RegionWriter>>,
}

impl FileStore {
    pub async fn new(root_dir: PathBuf, process: ProcessRecord) -> Result<Self> {
        fs::create_dir_all(&root_dir).await.map_err(|err| {
            FaninError::StorageUnavailable(format!(
                "metrics directory {} is not writable: {err}",
                root_dir.display()
            ))
        })?;

        Ok(Self {
            root_dir,
            process,
            writer: Mutex::new(None),
        })
    }

    pub fn root_dir(&self) -> &PathBuf {
        &self.root_dir
    }

    pub fn region_path(&self, process: &ProcessRecord) -> PathBuf {
        self.root_dir.join(region_file_name(process))
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Option<RegionWriter>>> {
        self.writer
            .lock()
            .map_err(|_| FaninError::InternalError("region writer lock poisoned".to_string()))
    }

    async fn region_owners(&self) -> Result<Vec<(ProcessRecord, PathBuf)>> {
        let mut entries = fs::read_dir(&self.root_dir).await.map_err(|err| {
            FaninError::StorageUnavailable(format!(
                "cannot list metrics directory {}: {err}",
                self.root_dir.display()
            ))
        })?;

        let mut owners = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            match parse_region_file_name(&name) {
                Some(owner) => owners.push((owner, entry.path())),
                None => debug!(file = %name, "ignoring non-region file"),
            }
        }

        owners.sort_by(|left, right| left.0.cmp(&right.0));
        Ok(owners)
    }

    fn is_alive(&self, owner: &ProcessRecord, processes: &dyn ProcessTable) -> bool {
        *owner == self.process || processes.is_alive(owner)
    }
}

#[async_trait]
impl MetricStore for FileStore {
    fn kind(&self) -> StoreKind {
        StoreKind::File
    }

    fn process(&self) -> ProcessRecord {
        self.process
    }

    async fn ping(&self) -> Result<()> {
        match fs::metadata(&self.root_dir).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(FaninError::StorageUnavailable(format!(
                "{} is not a directory",
                self.root_dir.display()
            ))),
            Err(err) => Err(FaninError::StorageUnavailable(format!(
                "metrics directory {} is unreachable: {err}",
                self.root_dir.display()
            ))),
        }
    }

    async fn write(&self, meta: &SeriesMeta, op: WriteOp) -> Result<()> {
        let key = meta.canonical()?;
        let mut guard = self.lock_writer()?;

        if guard.is_none() {
            let path = self.region_path(&self.process);
            let writer = RegionWriter::open(&path).map_err(|err| match err {
                FaninError::Io(io) => FaninError::StorageUnavailable(format!(
                    "cannot open region {}: {io}",
                    path.display()
                )),
                other => other,
            })?;
            debug!(path = %writer.path().display(), "opened metrics region");
            *guard = Some(writer);
        }

        let writer = guard
            .as_mut()
            .ok_or_else(|| FaninError::InternalError("region writer missing".to_string()))?;
        writer.update(&key, meta.value_count(), time::now_unix_seconds(), |cells| {
            op.apply(cells)
        })
    }

    async fn scan(&self, processes: &dyn ProcessTable) -> Result<StoreScan> {
        let mut scan = StoreScan::default();

        for (owner, path) in self.region_owners().await? {
            let live = self.is_alive(&owner, processes);
            let Some((samples, corrupt)) = read_region(owner, live, &path).await else {
                continue;
            };

            if !live {
                scan.stale.push(owner);
            }
            scan.samples.extend(samples);
            scan.corrupt += corrupt;
        }

        Ok(scan)
    }

    async fn stale_processes(&self, processes: &dyn ProcessTable) -> Result<Vec<ProcessRecord>> {
        Ok(self
            .region_owners()
            .await?
            .into_iter()
            .map(|(owner, _)| owner)
            .filter(|owner| !self.is_alive(owner, processes))
            .collect())
    }

    async fn purge(&self, process: &ProcessRecord) -> Result<usize> {
        if *process == self.process {
            self.lock_writer()?.take();
        }

        let path = self.region_path(process);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(1),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(FaninError::Io(err)),
        }
    }
}

/// Reads and decodes one region, re-reading it while a slot looks torn by a
/// concurrent writer. Returns `None` when the region vanished mid-scan.
async fn read_region(
    owner: ProcessRecord,
    live: bool,
    path: &Path,
) -> Option<(Vec<ProcessSample>, usize)> {
    let location = path.display().to_string();
    let mut attempt = 1;
    loop {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            // removed by a concurrent sweep
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %location, error = %err, "failed to read metrics region");
                return Some((Vec::new(), 1));
            }
        };

        let (samples, errors) = decode_samples(owner, live, &bytes, &location);
        if errors.is_empty() || attempt == READ_ATTEMPTS {
            for err in &errors {
                warn!(path = %location, kind = err.kind_label(), error = %err, "skipping corrupt metrics data");
            }
            return Some((samples, errors.len()));
        }

        debug!(path = %location, attempt, "region changed while reading, retrying");
        attempt += 1;
    }
}

fn decode_samples(
    owner: ProcessRecord,
    live: bool,
    bytes: &[u8],
    location: &str,
) -> (Vec<ProcessSample>, Vec<FaninError>) {
    let slots = match decode_region(bytes, location) {
        Ok(slots) => slots,
        Err(err) => return (Vec::new(), vec![err]),
    };

    let mut samples = Vec::with_capacity(slots.len());
    let mut errors = Vec::new();
    for slot in slots {
        let decoded = serde_json::from_str::<SeriesMeta>(&slot.key)
            .map_err(|err| FaninError::corrupt(location, format!("unreadable series key: {err}")))
            .and_then(|meta| {
                let value = SampleValue::from_cells(&meta, &slot.cells, slot.timestamp)?;
                Ok((meta, value))
            });
        match decoded {
            Ok((meta, value)) => samples.push(ProcessSample {
                process: owner,
                meta,
                value,
                live,
            }),
            Err(err) => errors.push(err),
        }
    }
    (samples, errors)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use fanin_common::types::{GaugeMode, MetricKind};

    use super::*;
    use crate::liveness::StaticProcessTable;

    fn counter_meta() -> SeriesMeta {
        SeriesMeta {
            name: "requests_total".to_string(),
            kind: MetricKind::Counter,
            gauge_mode: None,
            label_names: vec!["method".to_string()],
            label_values: vec!["GET".to_string()],
            buckets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn region_is_created_on_first_write_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let process = ProcessRecord::new(100, 1);
        let store = FileStore::new(dir.path().to_path_buf(), process)
            .await
            .expect("store");

        assert!(!store.region_path(&process).exists());
        store
            .write(&counter_meta(), WriteOp::Add(1.0))
            .await
            .expect("write");
        assert!(store.region_path(&process).exists());
    }

    #[tokio::test]
    async fn scan_reports_samples_from_every_region() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = ProcessRecord::new(100, 1);
        let second = ProcessRecord::new(200, 1);
        let writer_a = FileStore::new(dir.path().to_path_buf(), first).await.expect("store");
        let writer_b = FileStore::new(dir.path().to_path_buf(), second).await.expect("store");

        writer_a.write(&counter_meta(), WriteOp::Add(2.0)).await.expect("write");
        writer_b.write(&counter_meta(), WriteOp::Add(3.0)).await.expect("write");

        let gauge = SeriesMeta {
            name: "temperature".to_string(),
            kind: MetricKind::Gauge,
            gauge_mode: Some(GaugeMode::Max),
            label_names: Vec::new(),
            label_values: Vec::new(),
            buckets: Vec::new(),
        };
        writer_b.write(&gauge, WriteOp::Set(21.5)).await.expect("write");

        let reader = FileStore::new(dir.path().to_path_buf(), ProcessRecord::new(300, 1))
            .await
            .expect("reader");
        let table = StaticProcessTable::new([first]);
        let scan = reader.scan(&table).await.expect("scan");

        assert_eq!(scan.samples.len(), 3);
        assert_eq!(scan.stale, vec![second]);
        assert_eq!(scan.corrupt, 0);

        let live_values = scan
            .samples
            .iter()
            .filter(|sample| sample.live)
            .map(|sample| sample.value.clone())
            .collect::<Vec<_>>();
        assert_eq!(live_values.len(), 1);
        assert!(matches!(live_values[0], SampleValue::Scalar { value, .. } if value == 2.0));
        assert!(!reader.region_path(&ProcessRecord::new(300, 1)).exists());
    }

    #[tokio::test]
    async fn corrupt_regions_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = ProcessRecord::new(100, 1);
        let store = FileStore::new(dir.path().to_path_buf(), good).await.expect("store");
        store.write(&counter_meta(), WriteOp::Add(1.0)).await.expect("write");

        std::fs::write(dir.path().join("region_999-1.db"), b"garbage").expect("write garbage");
        std::fs::write(dir.path().join("README"), b"not a region").expect("write other");

        let scan = store
            .scan(&StaticProcessTable::new([good, ProcessRecord::new(999, 1)]))
            .await
            .expect("scan");
        assert_eq!(scan.samples.len(), 1);
        assert_eq!(scan.corrupt, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn histograms_stay_cumulative_while_being_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer_process = ProcessRecord::new(100, 1);
        let meta = SeriesMeta {
            name: "latency_seconds".to_string(),
            kind: MetricKind::Histogram,
            gauge_mode: None,
            label_names: Vec::new(),
            label_values: Vec::new(),
            buckets: (1..=64).map(f64::from).collect(),
        };

        let writer = Arc::new(
            FileStore::new(dir.path().to_path_buf(), writer_process)
                .await
                .expect("store"),
        );
        writer
            .write(&meta, WriteOp::Observe { bucket: 0, value: 0.5 })
            .await
            .expect("first write");

        let stop = Arc::new(AtomicBool::new(false));
        let writing = {
            let writer = Arc::clone(&writer);
            let meta = meta.clone();
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    writer
                        .write(&meta, WriteOp::Observe { bucket: 0, value: 0.5 })
                        .await
                        .expect("write");
                }
            })
        };

        let reader = FileStore::new(dir.path().to_path_buf(), ProcessRecord::new(200, 1))
            .await
            .expect("reader");
        let table = StaticProcessTable::new([writer_process]);
        let mut last_count = 0.0;
        for _ in 0..1000 {
            let scan = reader.scan(&table).await.expect("scan");
            assert_eq!(scan.corrupt, 0);
            assert_eq!(scan.samples.len(), 1);
            let SampleValue::Histogram { cumulative, .. } = &scan.samples[0].value else {
                panic!("expected histogram sample");
            };
            assert!(cumulative.windows(2).all(|pair| pair[0] <= pair[1]));
            assert!(cumulative[0] >= last_count);
            last_count = cumulative[0];
        }

        stop.store(true, Ordering::Relaxed);
        writing.await.expect("writer task");
    }

    #[tokio::test]
    async fn purge_removes_region_and_release_drops_own() {
        let dir = tempfile::tempdir().expect("tempdir");
        let process = ProcessRecord::new(100, 1);
        let store = FileStore::new(dir.path().to_path_buf(), process).await.expect("store");
        store.write(&counter_meta(), WriteOp::Add(1.0)).await.expect("write");

        assert_eq!(store.release().await.expect("release"), 1);
        assert!(!store.region_path(&process).exists());
        assert_eq!(store.purge(&process).await.expect("purge again"), 0);

        // a later write recreates the region from scratch
        store.write(&counter_meta(), WriteOp::Add(5.0)).await.expect("write");
        let scan = store.scan(&StaticProcessTable::default()).await.expect("scan");
        assert!(matches!(scan.samples[0].value, SampleValue::Scalar { value, .. } if value == 5.0));
    }

    #[tokio::test]
    async fn ping_fails_once_the_directory_is_gone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("metrics");
        let store = FileStore::new(root.clone(), ProcessRecord::new(1, 1))
            .await
            .expect("store");
        store.ping().await.expect("ping");

        std::fs::remove_dir_all(&root).expect("remove dir");
        assert!(matches!(store.ping().await, Err(FaninError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn stale_processes_excludes_self_and_live_owners() {
        let dir = tempfile::tempdir().expect("tempdir");
        let me = ProcessRecord::new(1, 1);
        let live = ProcessRecord::new(2, 1);
        let dead = ProcessRecord::new(3, 1);
        for process in [me, live, dead] {
            FileStore::new(dir.path().to_path_buf(), process)
                .await
                .expect("store")
                .write(&counter_meta(), WriteOp::Add(1.0))
                .await
                .expect("write");
        }

        let store = FileStore::new(dir.path().to_path_buf(), me).await.expect("store");
        let stale = store
            .stale_processes(&StaticProcessTable::new([live]))
            .await
            .expect("stale");
        assert_eq!(stale, vec![dead]);
    }
}
