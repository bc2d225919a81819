use std::{collections::BTreeMap, time::Duration};

use bronze_types::{PartitionId, Source};
use metric::{Attributes, DurationGauge, Metric, U64Counter, U64Gauge};

/// Instruments of one partition of one source.
#[derive(Debug)]
pub(crate) struct PartitionMetrics {
    pub(crate) received: U64Counter,
    pub(crate) malformed: U64Counter,
    pub(crate) unsupported_operation: U64Counter,
    pub(crate) dead_lettered: U64Counter,
    pub(crate) created: U64Counter,
    pub(crate) duplicate: U64Counter,
    pub(crate) write_failed: U64Counter,
    pub(crate) checkpoint_lag: U64Gauge,
    pub(crate) time_to_lake: DurationGauge,
}

impl PartitionMetrics {
    pub(crate) fn normalize_failed(&self, reason: &str) -> &U64Counter {
        match reason {
            "unsupported_operation" => &self.unsupported_operation,
            _ => &self.malformed,
        }
    }

    pub(crate) fn record_time_to_lake(&self, d: Duration) {
        self.time_to_lake.set(d);
    }
}

/// Registered consumer metrics of one source.
#[derive(Debug)]
pub(crate) struct ConsumerMetrics {
    source: Source,
    received: Metric<U64Counter>,
    normalize_failed: Metric<U64Counter>,
    dead_lettered: Metric<U64Counter>,
    written: Metric<U64Counter>,
    write_failed: Metric<U64Counter>,
    checkpoint_lag: Metric<U64Gauge>,
    time_to_lake: Metric<DurationGauge>,
    partitions: BTreeMap<PartitionId, PartitionMetrics>,
}

impl ConsumerMetrics {
    pub(crate) fn new(registry: &metric::Registry, source: Source) -> Self {
        Self {
            source,
            received: registry.register_metric(
                "bronze_events_received",
                "number of raw change events read from the channel",
            ),
            normalize_failed: registry.register_metric(
                "bronze_events_normalize_failed",
                "number of raw change events that could not be normalized",
            ),
            dead_lettered: registry.register_metric(
                "bronze_events_dead_lettered",
                "number of raw change events written to the dead-letter store",
            ),
            written: registry.register_metric(
                "bronze_events_written",
                "number of change events written to the lake, by result",
            ),
            write_failed: registry.register_metric(
                "bronze_events_write_failed",
                "number of change events whose lake write failed after retrying",
            ),
            checkpoint_lag: registry.register_metric(
                "bronze_checkpoint_lag",
                "number of channel records after the committed checkpoint",
            ),
            time_to_lake: registry.register_metric(
                "bronze_time_to_lake",
                "time between a change at the source and its lake write",
            ),
            partitions: Default::default(),
        }
    }

    /// Instruments of `partition`, created on first use.
    pub(crate) fn partition(&mut self, partition: PartitionId) -> &PartitionMetrics {
        let source = self.source;
        let attrs = |extra: Option<(&'static str, &'static str)>| {
            let mut attrs = Attributes::from([
                ("source", source.as_str().into()),
                ("partition", partition.to_string().into()),
            ]);
            if let Some((k, v)) = extra {
                attrs.insert(k, v);
            }
            attrs
        };

        self.partitions
            .entry(partition)
            .or_insert_with(|| PartitionMetrics {
                received: self.received.recorder(attrs(None)),
                malformed: self
                    .normalize_failed
                    .recorder(attrs(Some(("reason", "malformed")))),
                unsupported_operation: self
                    .normalize_failed
                    .recorder(attrs(Some(("reason", "unsupported_operation")))),
                dead_lettered: self.dead_lettered.recorder(attrs(None)),
                created: self.written.recorder(attrs(Some(("result", "created")))),
                duplicate: self.written.recorder(attrs(Some(("result", "duplicate")))),
                write_failed: self.write_failed.recorder(attrs(None)),
                checkpoint_lag: self.checkpoint_lag.recorder(attrs(None)),
                time_to_lake: self.time_to_lake.recorder(attrs(None)),
            })
    }
}

/// Restart bookkeeping of the supervisor.
#[derive(Debug, Clone)]
pub(crate) struct SupervisorMetrics {
    pub(crate) restarts: U64Counter,
    pub(crate) fatal: U64Counter,
}

impl SupervisorMetrics {
    pub(crate) fn new(registry: &metric::Registry, source: Source) -> Self {
        let attrs = Attributes::from(&[("source", source.as_str())]);
        Self {
            restarts: registry
                .register_metric::<U64Counter>(
                    "bronze_consumer_restarts",
                    "number of times a consumer task was restarted after failing",
                )
                .recorder(attrs.clone()),
            fatal: registry
                .register_metric::<U64Counter>(
                    "bronze_consumer_fatal",
                    "number of consumer tasks stopped by an unrecoverable error",
                )
                .recorder(attrs),
        }
    }
}
