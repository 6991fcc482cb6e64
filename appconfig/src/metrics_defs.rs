//! Metrics definitions for the refresh engine.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REFRESH_CYCLE_DURATION: MetricDef = MetricDef {
    name: "refresh.cycle.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a refresh cycle in seconds",
};

pub const REFRESH_EVENT_PUBLISHED: MetricDef = MetricDef {
    name: "refresh.event.published",
    metric_type: MetricType::Counter,
    description: "Number of refresh events published after a detected change",
};

pub const REFRESH_STORE_FAILED: MetricDef = MetricDef {
    name: "refresh.store.failed",
    metric_type: MetricType::Counter,
    description: "Number of store checks that failed on every available replica",
};

pub const REPLICA_BACKOFF: MetricDef = MetricDef {
    name: "replica.backoff",
    metric_type: MetricType::Counter,
    description: "Number of times a replica was put into backoff",
};

pub const REPLICA_FAILOVER: MetricDef = MetricDef {
    name: "replica.failover",
    metric_type: MetricType::Counter,
    description: "Number of requests retried on the next replica after a retryable failure",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REFRESH_CYCLE_DURATION,
    REFRESH_EVENT_PUBLISHED,
    REFRESH_STORE_FAILED,
    REPLICA_BACKOFF,
    REPLICA_FAILOVER,
];
