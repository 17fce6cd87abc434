//! Prometheus instruments for the sink, DLQ router, and compactor.

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};

pub struct SinkMetrics {
    registry: Registry,
    pub events_flushed: IntCounter,
    pub events_naked: IntCounter,
    pub poison_terminated: IntCounter,
    pub batches_uploaded: IntCounter,
    pub flush_failures: IntCounter,
    pub bytes_written: IntCounter,
    pub dlq_routed: IntCounter,
    pub dlq_failures: IntCounter,
    pub dlq_depth: IntGauge,
    pub compaction_partitions: IntCounter,
    pub compaction_files_merged: IntCounter,
    pub compaction_bytes_written: IntCounter,
    pub compaction_failures: IntCounter,
}

impl SinkMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            IntCounter::new(name.to_owned(), help.to_owned()).expect("metric definition")
        };

        let events_flushed = counter(
            "sink_events_flushed_total",
            "Events durably written and acked",
        );
        let events_naked = counter(
            "sink_events_naked_total",
            "Events returned to the stream after a failed upload",
        );
        let poison_terminated = counter(
            "sink_poison_terminated_total",
            "Undecodable messages terminated without redelivery",
        );
        let batches_uploaded = counter(
            "sink_batches_uploaded_total",
            "Partition files uploaded to object storage",
        );
        let flush_failures = counter(
            "sink_flush_failures_total",
            "Partition flushes that failed to serialize or upload",
        );
        let bytes_written = counter(
            "sink_bytes_written_total",
            "Parquet bytes uploaded by flushes",
        );
        let dlq_routed = counter(
            "sink_dlq_routed_total",
            "Messages republished onto the DLQ stream",
        );
        let dlq_failures = counter(
            "sink_dlq_failures_total",
            "Advisories that could not be routed to the DLQ",
        );
        let dlq_depth = IntGauge::new(
            "sink_dlq_depth",
            "Messages currently retained on the DLQ stream",
        )
        .expect("metric definition");
        let compaction_partitions = counter(
            "sink_compaction_partitions_total",
            "Cold partitions visited by compaction",
        );
        let compaction_files_merged = counter(
            "sink_compaction_files_merged_total",
            "Small files merged away by compaction",
        );
        let compaction_bytes_written = counter(
            "sink_compaction_bytes_written_total",
            "Bytes written into merged compaction outputs",
        );
        let compaction_failures = counter(
            "sink_compaction_failures_total",
            "Compaction batches that failed",
        );

        for collector in [
            Box::new(events_flushed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(events_naked.clone()),
            Box::new(poison_terminated.clone()),
            Box::new(batches_uploaded.clone()),
            Box::new(flush_failures.clone()),
            Box::new(bytes_written.clone()),
            Box::new(dlq_routed.clone()),
            Box::new(dlq_failures.clone()),
            Box::new(dlq_depth.clone()),
            Box::new(compaction_partitions.clone()),
            Box::new(compaction_files_merged.clone()),
            Box::new(compaction_bytes_written.clone()),
            Box::new(compaction_failures.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Self {
            registry,
            events_flushed,
            events_naked,
            poison_terminated,
            batches_uploaded,
            flush_failures,
            bytes_written,
            dlq_routed,
            dlq_failures,
            dlq_depth,
            compaction_partitions,
            compaction_files_merged,
            compaction_bytes_written,
            compaction_failures,
        }
    }

    pub fn render(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for SinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}
