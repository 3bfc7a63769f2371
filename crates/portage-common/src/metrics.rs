//! Metrics registry for Portage observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconciliation (duration, errors)
//! - Data-path sessions (active count, bytes moved)
//! - Request phases (terminal outcome counts)

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for Portage metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("portage"));

/// Histogram of reconciliation duration
///
/// Labels:
/// - `kind`: dataupload, datadownload
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("portage_reconcile_duration_seconds")
        .with_description("Duration of record reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `kind`: dataupload, datadownload
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("portage_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Gauge of data-path sessions currently held on this node
pub static ACTIVE_SESSIONS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("portage_data_path_sessions")
        .with_description("Number of in-flight data-path sessions on this node")
        .with_unit("{sessions}")
        .build()
});

/// Counter of bytes moved by completed sessions
///
/// Labels:
/// - `direction`: upload, download
pub static BYTES_MOVED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("portage_data_moved_bytes_total")
        .with_description("Total bytes moved between volumes and the object store")
        .with_unit("By")
        .build()
});

/// Counter of requests reaching a terminal phase
///
/// Labels:
/// - `kind`: dataupload, datadownload
/// - `phase`: Completed, Failed, Canceled
pub static TERMINAL_PHASES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("portage_terminal_phases_total")
        .with_description("Total number of requests reaching a terminal phase")
        .with_unit("{requests}")
        .build()
});

/// Record the current number of active data-path sessions
pub fn set_active_sessions(count: usize) {
    ACTIVE_SESSIONS.record(count as i64, &[]);
}

/// Count a request reaching a terminal phase
pub fn count_terminal_phase(kind: &'static str, phase: &str) {
    TERMINAL_PHASES.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("phase", phase.to_string()),
        ],
    );
}

/// Count bytes moved by a finished session
pub fn count_bytes_moved(direction: &'static str, bytes: i64) {
    if bytes > 0 {
        BYTES_MOVED.add(bytes as u64, &[KeyValue::new("direction", direction)]);
    }
}

/// Times one reconciliation and records duration + outcome on drop paths
pub struct ReconcileTimer {
    start: Instant,
    kind: &'static str,
}

impl ReconcileTimer {
    /// Start timing a reconciliation of the given record kind
    pub fn start(kind: &'static str) -> Self {
        Self {
            start: Instant::now(),
            kind,
        }
    }

    /// Record a successful reconciliation
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a failed reconciliation of the given error class
    pub fn error(self, error_type: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("error_type", error_type),
            ],
        );
    }
}
