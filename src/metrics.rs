use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    // Migrations
    pub migrations_started_total: AtomicU64,
    pub migrations_succeeded_total: AtomicU64,
    pub migrations_failed_total: AtomicU64,

    // Movement
    pub tables_copied_total: AtomicU64,
    pub tables_deleted_total: AtomicU64,
    pub dblink_statements_total: AtomicU64,

    // Repair
    pub conflicts_resolved_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            migrations_started_total: AtomicU64::new(0),
            migrations_succeeded_total: AtomicU64::new(0),
            migrations_failed_total: AtomicU64::new(0),
            tables_copied_total: AtomicU64::new(0),
            tables_deleted_total: AtomicU64::new(0),
            dblink_statements_total: AtomicU64::new(0),
            conflicts_resolved_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_table_copied() {
    metrics().tables_copied_total.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_table_deleted() {
    metrics().tables_deleted_total.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_dblink_statement() {
    metrics()
        .dblink_statements_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_conflict_resolved() {
    metrics()
        .conflicts_resolved_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_migration_started() {
    metrics()
        .migrations_started_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_migration_finished(succeeded: bool) {
    let counter = if succeeded {
        &metrics().migrations_succeeded_total
    } else {
        &metrics().migrations_failed_total
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let _ = writeln!(
        s,
        "# TYPE migrations_started_total counter\nmigrations_started_total {}",
        m.migrations_started_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE migrations_succeeded_total counter\nmigrations_succeeded_total {}",
        m.migrations_succeeded_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE migrations_failed_total counter\nmigrations_failed_total {}",
        m.migrations_failed_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE tables_copied_total counter\ntables_copied_total {}",
        m.tables_copied_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE tables_deleted_total counter\ntables_deleted_total {}",
        m.tables_deleted_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE dblink_statements_total counter\ndblink_statements_total {}",
        m.dblink_statements_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE conflicts_resolved_total counter\nconflicts_resolved_total {}",
        m.conflicts_resolved_total.load(Ordering::Relaxed)
    );
    s
}
