use fanin_common::types::ProcessRecord;
use tracing::{info, warn};

use crate::liveness::ProcessTable;
use crate::traits::MetricStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub reclaimed: Vec<ProcessRecord>,
    pub failed: usize,
}

/// Deletes the regions of processes that are no longer running.
///
/// Failures are logged and skipped so one unremovable region never blocks the
/// rest of the sweep.
pub async fn reap_stale(store: &dyn MetricStore, processes: &dyn ProcessTable) -> ReapReport {
    processes.refresh();
    let stale = match store.stale_processes(processes).await {
        Ok(stale) => stale,
        Err(err) => {
            warn!(backend = store.kind().as_str(), error = %err, "failed to list metrics owners");
            return ReapReport {
                reclaimed: Vec::new(),
                failed: 1,
            };
        }
    };

    purge_all(store, &stale).await
}

pub async fn purge_all(store: &dyn MetricStore, stale: &[ProcessRecord]) -> ReapReport {
    let mut report = ReapReport::default();
    for process in stale {
        match store.purge(process).await {
            Ok(_) => {
                info!(backend = store.kind().as_str(), process = %process, "reclaimed dead process metrics");
                report.reclaimed.push(*process);
            }
            Err(err) => {
                warn!(
                    backend = store.kind().as_str(),
                    process = %process,
                    error = %err,
                    "failed to reclaim dead process metrics"
                );
                report.failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use fanin_common::types::{MetricKind, SeriesMeta};

    use super::*;
    use crate::file::FileStore;
    use crate::liveness::StaticProcessTable;
    use crate::traits::WriteOp;

    #[tokio::test]
    async fn reaps_only_dead_regions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = SeriesMeta {
            name: "jobs_total".to_string(),
            kind: MetricKind::Counter,
            gauge_mode: None,
            label_names: Vec::new(),
            label_values: Vec::new(),
            buckets: Vec::new(),
        };

        let alive = ProcessRecord::new(1, 1);
        let dead = ProcessRecord::new(2, 1);
        for process in [alive, dead] {
            FileStore::new(dir.path().to_path_buf(), process)
                .await
                .expect("store")
                .write(&meta, WriteOp::Add(1.0))
                .await
                .expect("write");
        }

        let sweeper = FileStore::new(dir.path().to_path_buf(), ProcessRecord::new(3, 1))
            .await
            .expect("store");
        let table = StaticProcessTable::new([alive]);
        let report = reap_stale(&sweeper, &table).await;

        assert_eq!(report.reclaimed, vec![dead]);
        assert_eq!(report.failed, 0);
        assert!(sweeper.region_path(&alive).exists());
        assert!(!sweeper.region_path(&dead).exists());
    }
}
