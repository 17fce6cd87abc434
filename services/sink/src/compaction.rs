//! Background compaction of small partition files.
//!
//! Many small flush files per partition slow the query engine down; the
//! compactor merges them into files near the configured target size.
//!
//! Safety rule: only cold partitions are rewritten.  A partition is cold
//! when its hour is at least `lag_hours` behind the current wall-clock
//! hour (UTC), so the partition the sink is actively writing is never
//! touched.  The clock is injectable so the rule is testable without
//! waiting for real hours to pass.

use crate::columnar;
use crate::config::CompactionConfig;
use crate::metrics::SinkMetrics;
use crate::store::{BlobStore, ObjectMeta, StoreError};
use causality_protocol::PartitionKey;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome of one compaction pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub partitions_visited: usize,
    pub files_merged: usize,
    pub files_written: usize,
    pub bytes_written: u64,
    pub failures: usize,
}

pub struct Compactor {
    store: Arc<dyn BlobStore>,
    metrics: Arc<SinkMetrics>,
    cfg: CompactionConfig,
    prefix: String,
    clock: Clock,
}

impl Compactor {
    pub fn new(
        store: Arc<dyn BlobStore>,
        metrics: Arc<SinkMetrics>,
        cfg: CompactionConfig,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            metrics,
            cfg,
            prefix: prefix.into(),
            clock: Box::new(Utc::now),
        }
    }

    /// Replace the wall clock; tests pin it to a fixed instant.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Ticker-driven loop; exits when the stop signal flips.
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) => {
                            if report.files_merged > 0 {
                                info!(
                                    partitions = report.partitions_visited,
                                    merged = report.files_merged,
                                    written = report.files_written,
                                    bytes = report.bytes_written,
                                    "compaction pass complete"
                                );
                            }
                        }
                        Err(e) => warn!(error = %e, "compaction pass failed"),
                    }
                }
            }
        }
        info!("compactor stopped");
    }

    /// One full pass over every cold partition.  Per-batch failures are
    /// counted and do not abort the rest of the pass.
    pub async fn run_once(&self) -> Result<CompactionReport, StoreError> {
        let root = format!("{}/", self.prefix.trim_end_matches('/'));
        let objects = self.store.list(&root).await?;

        let mut partitions: BTreeMap<PartitionKey, Vec<ObjectMeta>> = BTreeMap::new();
        for object in objects {
            match parse_partition(&object.key) {
                Some(partition) => partitions.entry(partition).or_default().push(object),
                None => debug!(key = %object.key, "skipping unpartitioned object"),
            }
        }

        let now = (self.clock)();
        let mut report = CompactionReport::default();

        for (partition, files) in partitions {
            if !self.is_cold(&partition, now) {
                continue;
            }
            report.partitions_visited += 1;
            self.metrics.compaction_partitions.inc();

            let mut candidates: Vec<ObjectMeta> = files
                .into_iter()
                .filter(|f| f.size < self.cfg.small_threshold_bytes)
                .collect();
            if candidates.len() < 2 {
                continue;
            }
            candidates.sort_by(|a, b| a.key.cmp(&b.key));

            for batch in group_by_target(&candidates, self.cfg.target_bytes) {
                if batch.len() < 2 {
                    continue;
                }
                match self.compact_batch(&partition, &batch).await {
                    Ok(bytes_written) => {
                        report.files_merged += batch.len();
                        report.files_written += 1;
                        report.bytes_written += bytes_written;
                        self.metrics.compaction_files_merged.inc_by(batch.len() as u64);
                        self.metrics.compaction_bytes_written.inc_by(bytes_written);
                    }
                    Err(e) => {
                        report.failures += 1;
                        self.metrics.compaction_failures.inc();
                        warn!(partition = %partition, error = %e, "compaction batch failed");
                    }
                }
            }
        }

        Ok(report)
    }

    fn is_cold(&self, partition: &PartitionKey, now: DateTime<Utc>) -> bool {
        let Some(partition_start) = Utc
            .with_ymd_and_hms(
                partition.year,
                partition.month,
                partition.day,
                partition.hour,
                0,
                0,
            )
            .single()
        else {
            // A partition hour chrono cannot represent never becomes cold;
            // leaving garbage in place beats rewriting it blind.
            return false;
        };
        let hour_floor = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        hour_floor - partition_start >= ChronoDuration::hours(i64::from(self.cfg.lag_hours))
    }

    /// Read every source file, merge their row groups into one output,
    /// upload it under the same partition, then delete the sources in one
    /// batched call.
    async fn compact_batch(
        &self,
        partition: &PartitionKey,
        batch: &[ObjectMeta],
    ) -> Result<u64, CompactionError> {
        let mut merged = Vec::new();
        for object in batch {
            let data = self.store.get(&object.key).await?;
            merged.extend(columnar::decode_batches(data)?);
        }

        let bytes = columnar::encode_batches(&merged)?;
        let size = bytes.len() as u64;
        let output_key = partition.object_key(&self.prefix, &Uuid::new_v4().to_string());
        self.store.put(&output_key, bytes).await?;

        let source_keys: Vec<String> = batch.iter().map(|o| o.key.clone()).collect();
        if let Err(e) = self.store.delete_many(&source_keys).await {
            // The merged file is already durable; leftover sources mean
            // duplicate rows until the next pass, not data loss.
            warn!(error = %e, "source delete failed after merge");
            return Err(e.into());
        }
        debug!(partition = %partition, sources = batch.len(), output = %output_key, "batch compacted");
        Ok(size)
    }
}

#[derive(Debug, thiserror::Error)]
enum CompactionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Columnar(#[from] columnar::ColumnarError),
}

/// Parse a partition out of a path-style object key:
/// `<prefix>/app_id=<A>/year=<Y>/month=<M>/day=<D>/hour=<H>/<file>`.
pub fn parse_partition(key: &str) -> Option<PartitionKey> {
    let mut app_id = None;
    let mut year = None;
    let mut month = None;
    let mut day = None;
    let mut hour = None;

    for segment in key.split('/') {
        if let Some((field, value)) = segment.split_once('=') {
            match field {
                "app_id" => app_id = Some(value.to_owned()),
                "year" => year = value.parse().ok(),
                "month" => month = value.parse().ok(),
                "day" => day = value.parse().ok(),
                "hour" => hour = value.parse().ok(),
                _ => {}
            }
        }
    }

    Some(PartitionKey {
        app_id: app_id?,
        year: year?,
        month: month?,
        day: day?,
        hour: hour?,
    })
}

/// Greedy grouping: consecutive files accumulate until adding the next one
/// would push the combined size past `target_bytes`.
fn group_by_target(files: &[ObjectMeta], target_bytes: u64) -> Vec<Vec<ObjectMeta>> {
    let mut batches = Vec::new();
    let mut current: Vec<ObjectMeta> = Vec::new();
    let mut current_size = 0u64;

    for file in files {
        if !current.is_empty() && current_size + file.size > target_bytes {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += file.size;
        current.push(file.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_parses_from_object_key() {
        let key = "events/app_id=app-1/year=2026/month=01/day=15/hour=10/events_x.parquet";
        let partition = parse_partition(key).expect("parse");
        assert_eq!(partition.app_id, "app-1");
        assert_eq!(partition.year, 2026);
        assert_eq!(partition.month, 1);
        assert_eq!(partition.hour, 10);

        assert!(parse_partition("events/loose_file.parquet").is_none());
    }

    #[test]
    fn grouping_respects_target_size() {
        let file = |key: &str, size: u64| ObjectMeta {
            key: key.to_owned(),
            size,
        };
        let files = vec![file("a", 40), file("b", 40), file("c", 40), file("d", 10)];
        let batches = group_by_target(&files, 100);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2); // a + b = 80; c would make 120
        assert_eq!(batches[1].len(), 2); // c + d = 50
    }

    #[test]
    fn oversized_file_gets_its_own_batch() {
        let file = |key: &str, size: u64| ObjectMeta {
            key: key.to_owned(),
            size,
        };
        let files = vec![file("a", 200), file("b", 10), file("c", 10)];
        let batches = group_by_target(&files, 100);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].len(), 2);
    }
}
