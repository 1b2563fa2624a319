//! Prometheus metrics collection (§0.5).
//!
//! Grounded on the existing `MetricsCollector`, trimmed of the Redis/auth/DNP
//! business metrics this system has no counterpart for, and extended with
//! the per-queue depth gauges, state-transition counter, and save-and-finalize
//! failure counter §0.5 calls for.

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{Disks, System};

/// Metrics collector with Prometheus integration.
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // HTTP metrics
    http_requests_total: CounterVec,
    http_request_duration: HistogramVec,
    http_requests_in_flight: Gauge,
    http_request_latency: HistogramVec,

    // Database metrics
    db_connections_active: Gauge,
    db_connections_idle: Gauge,
    db_query_duration: HistogramVec,
    db_operations_total: CounterVec,

    // Pipeline business metrics (§0.5)
    queue_pending: GaugeVec,
    queue_active: GaugeVec,
    songs_generated_total: Counter,
    song_state_transitions_total: CounterVec,
    archival_failures_total: Counter,

    // System metrics
    memory_usage_bytes: Gauge,
    memory_rss_bytes: Gauge,
    cpu_usage_percent: Gauge,
    uptime_seconds: Gauge,
    disk_usage_bytes: Gauge,
    disk_available_bytes: Gauge,
    disk_total_bytes: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests")
                .namespace("infinitune")
                .subsystem("http"),
            &["method", "endpoint", "status_code"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .namespace("infinitune")
            .subsystem("http")
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "endpoint"],
        )?;

        let http_requests_in_flight = Gauge::new(
            "infinitune_http_requests_in_flight",
            "Number of HTTP requests currently being processed",
        )?;

        let http_request_latency = HistogramVec::new(
            HistogramOpts::new(
                "http_request_latency_seconds",
                "HTTP request latency in seconds for P50/P90/P99 calculations",
            )
            .namespace("infinitune")
            .subsystem("http")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
            &["method", "path", "status_code"],
        )?;

        let db_connections_active = Gauge::new(
            "infinitune_db_connections_active",
            "Number of active database connections",
        )?;

        let db_connections_idle = Gauge::new(
            "infinitune_db_connections_idle",
            "Number of idle database connections",
        )?;

        let db_query_duration = HistogramVec::new(
            HistogramOpts::new(
                "db_query_duration_seconds",
                "Database query duration in seconds",
            )
            .namespace("infinitune")
            .subsystem("db")
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["operation", "table"],
        )?;

        let db_operations_total = CounterVec::new(
            Opts::new("db_operations_total", "Total number of database operations")
                .namespace("infinitune")
                .subsystem("db"),
            &["operation", "table", "status"],
        )?;

        let queue_pending = GaugeVec::new(
            Opts::new("queue_pending", "Number of songs waiting in an endpoint queue")
                .namespace("infinitune"),
            &["endpoint"],
        )?;

        let queue_active = GaugeVec::new(
            Opts::new("queue_active", "Number of songs currently in flight on an endpoint")
                .namespace("infinitune"),
            &["endpoint"],
        )?;

        let songs_generated_total = Counter::new(
            "infinitune_songs_generated_total",
            "Total number of songs that reached ready",
        )?;

        let song_state_transitions_total = CounterVec::new(
            Opts::new(
                "song_state_transitions_total",
                "Total number of song status transitions",
            )
            .namespace("infinitune"),
            &["from", "to"],
        )?;

        let archival_failures_total = Counter::new(
            "infinitune_archival_failures_total",
            "Total number of save-and-finalize archival failures",
        )?;

        let memory_usage_bytes = Gauge::new(
            "infinitune_memory_usage_bytes",
            "Current total memory usage in bytes",
        )?;

        let memory_rss_bytes = Gauge::new(
            "infinitune_memory_rss_bytes",
            "Process resident set size (RSS) in bytes",
        )?;

        let cpu_usage_percent = Gauge::new(
            "infinitune_cpu_usage_percent",
            "Current CPU usage percentage",
        )?;

        let uptime_seconds = Gauge::new(
            "infinitune_uptime_seconds",
            "Application uptime in seconds",
        )?;

        let disk_usage_bytes = Gauge::new(
            "infinitune_disk_usage_bytes",
            "Disk space used by the music root in bytes",
        )?;

        let disk_available_bytes = Gauge::new(
            "infinitune_disk_available_bytes",
            "Available disk space for the music root in bytes",
        )?;

        let disk_total_bytes = Gauge::new(
            "infinitune_disk_total_bytes",
            "Total disk space for the music root in bytes",
        )?;

        let registry_ref = registry.as_ref();
        registry_ref.register(Box::new(http_requests_total.clone()))?;
        registry_ref.register(Box::new(http_request_duration.clone()))?;
        registry_ref.register(Box::new(http_requests_in_flight.clone()))?;
        registry_ref.register(Box::new(http_request_latency.clone()))?;
        registry_ref.register(Box::new(db_connections_active.clone()))?;
        registry_ref.register(Box::new(db_connections_idle.clone()))?;
        registry_ref.register(Box::new(db_query_duration.clone()))?;
        registry_ref.register(Box::new(db_operations_total.clone()))?;
        registry_ref.register(Box::new(queue_pending.clone()))?;
        registry_ref.register(Box::new(queue_active.clone()))?;
        registry_ref.register(Box::new(songs_generated_total.clone()))?;
        registry_ref.register(Box::new(song_state_transitions_total.clone()))?;
        registry_ref.register(Box::new(archival_failures_total.clone()))?;
        registry_ref.register(Box::new(memory_usage_bytes.clone()))?;
        registry_ref.register(Box::new(memory_rss_bytes.clone()))?;
        registry_ref.register(Box::new(cpu_usage_percent.clone()))?;
        registry_ref.register(Box::new(uptime_seconds.clone()))?;
        registry_ref.register(Box::new(disk_usage_bytes.clone()))?;
        registry_ref.register(Box::new(disk_available_bytes.clone()))?;
        registry_ref.register(Box::new(disk_total_bytes.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration,
            http_requests_in_flight,
            http_request_latency,
            db_connections_active,
            db_connections_idle,
            db_query_duration,
            db_operations_total,
            queue_pending,
            queue_active,
            songs_generated_total,
            song_state_transitions_total,
            archival_failures_total,
            memory_usage_bytes,
            memory_rss_bytes,
            cpu_usage_percent,
            uptime_seconds,
            disk_usage_bytes,
            disk_available_bytes,
            disk_total_bytes,
        })
    }

    pub fn record_http_request(&self, method: &Method, endpoint: &str, status_code: StatusCode) {
        self.http_requests_total
            .with_label_values(&[method.as_str(), endpoint, &status_code.as_u16().to_string()])
            .inc();
    }

    pub fn record_request_latency(
        &self,
        method: &str,
        path: &str,
        status_code: u16,
        duration: std::time::Duration,
    ) {
        self.http_request_latency
            .with_label_values(&[method, path, &status_code.to_string()])
            .observe(duration.as_secs_f64());
    }

    pub fn increment_in_flight_requests(&self) {
        self.http_requests_in_flight.inc();
    }

    pub fn decrement_in_flight_requests(&self) {
        self.http_requests_in_flight.dec();
    }

    pub fn update_db_connections(&self, active: u32, idle: u32) {
        self.db_connections_active.set(active as f64);
        self.db_connections_idle.set(idle as f64);
    }

    pub fn record_db_operation(&self, operation: &str, table: &str, success: bool, duration: std::time::Duration) {
        let status = if success { "success" } else { "failure" };
        self.db_operations_total
            .with_label_values(&[operation, table, status])
            .inc();
        self.db_query_duration
            .with_label_values(&[operation, table])
            .observe(duration.as_secs_f64());
    }

    /// §4.2 per-endpoint pending/active gauges.
    pub fn set_queue_depth(&self, endpoint: &str, pending: usize, active: usize) {
        self.queue_pending.with_label_values(&[endpoint]).set(pending as f64);
        self.queue_active.with_label_values(&[endpoint]).set(active as f64);
    }

    pub fn record_song_generated(&self) {
        self.songs_generated_total.inc();
    }

    pub fn record_song_transition(&self, from: &str, to: &str) {
        self.song_state_transitions_total
            .with_label_values(&[from, to])
            .inc();
    }

    pub fn record_archival_failure(&self) {
        self.archival_failures_total.inc();
    }

    /// Collect real system metrics using sysinfo: CPU usage, memory, disk
    /// usage for `data_dir` (the configured music root), and uptime.
    pub fn collect_real_system_metrics(&self, data_dir: &Path, uptime_secs: u64) {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_percent = if sys.cpus().is_empty() {
            0.0
        } else {
            sys.cpus().iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / sys.cpus().len() as f32
        };
        self.cpu_usage_percent.set(cpu_percent as f64);
        self.memory_usage_bytes.set(sys.used_memory() as f64);

        if let Ok(pid) = sysinfo::get_current_pid() {
            sys.refresh_process(pid);
            if let Some(process) = sys.process(pid) {
                self.memory_rss_bytes.set(process.memory() as f64);
            }
        }

        self.uptime_seconds.set(uptime_secs as f64);
        self.collect_disk_metrics(data_dir);
    }

    fn collect_disk_metrics(&self, data_dir: &Path) {
        let disks = Disks::new_with_refreshed_list();

        let abs_path = if data_dir.is_absolute() {
            data_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(data_dir))
                .unwrap_or_else(|_| data_dir.to_path_buf())
        };

        let mut best_match: Option<&sysinfo::Disk> = None;
        let mut best_match_len = 0;

        for disk in disks.list() {
            let mount_point = disk.mount_point();
            if abs_path.starts_with(mount_point) {
                let mount_len = mount_point.as_os_str().len();
                if mount_len > best_match_len {
                    best_match = Some(disk);
                    best_match_len = mount_len;
                }
            }
        }

        if let Some(disk) = best_match {
            let total = disk.total_space();
            let available = disk.available_space();
            self.disk_total_bytes.set(total as f64);
            self.disk_available_bytes.set(available as f64);
            self.disk_usage_bytes.set(total.saturating_sub(available) as f64);
        } else {
            self.disk_total_bytes.set(0.0);
            self.disk_available_bytes.set(0.0);
            self.disk_usage_bytes.set(0.0);
        }
    }

    pub fn get_metrics(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}

/// RAII timer that records HTTP request duration on drop via `finish`.
pub struct RequestTimer {
    metrics: Arc<MetricsCollector>,
    method: Method,
    endpoint: String,
    start: Instant,
}

impl RequestTimer {
    pub fn new(metrics: Arc<MetricsCollector>, method: Method, endpoint: String) -> Self {
        metrics.increment_in_flight_requests();
        Self {
            metrics,
            method,
            endpoint,
            start: Instant::now(),
        }
    }

    pub fn finish(self, status_code: StatusCode) {
        let duration = self.start.elapsed();
        self.metrics.record_http_request(&self.method, &self.endpoint, status_code);
        self.metrics
            .http_request_duration
            .with_label_values(&[self.method.as_str(), &self.endpoint])
            .observe(duration.as_secs_f64());
        self.metrics.decrement_in_flight_requests();
    }
}

/// Prometheus text-format metrics endpoint.
pub async fn metrics_handler(State(metrics): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    match metrics.get_metrics() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .unwrap(),
        Err(e) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(format!("failed to encode metrics: {e}"))
            .unwrap(),
    }
}

/// Database pool gauges, updated periodically from the supervisor tick.
#[derive(Clone)]
pub struct DatabaseMetrics {
    metrics: Arc<MetricsCollector>,
}

impl DatabaseMetrics {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }

    pub fn update_pool_metrics(&self, pool: &sqlx::PgPool) {
        let active = pool.size();
        let idle = pool.num_idle() as u32;
        self.metrics.update_db_connections(active.saturating_sub(idle), idle);
    }
}
