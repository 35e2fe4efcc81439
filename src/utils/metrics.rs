//! Prometheus metrics for collective communication observability.

use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
#[cfg(feature = "metrics-server")]
use tracing::info;

/// Global metrics registry
static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Collection of all coordinator metrics
pub struct MetricsRegistry {
    pub registry: Registry,

    /// Collectives dispatched, labelled by operation kind
    pub collectives_total: CounterVec,
    /// Communicator cache entries created
    pub communicator_inits: Counter,
    /// Root-id exchange latency
    pub rendezvous_time: Histogram,
    /// Host time spent inside `CollectiveTask::wait`
    pub task_wait_time: Histogram,
    pub wait_timeouts: Counter,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let collectives_total = CounterVec::new(
            Opts::new("xccl_collectives_total", "Collective operations dispatched"),
            &["op"],
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(collectives_total.clone()))
            .expect("metric registered once");

        let communicator_inits = Counter::with_opts(Opts::new(
            "xccl_communicator_inits_total",
            "Communicator cache entries created",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(communicator_inits.clone()))
            .expect("metric registered once");

        let rendezvous_time = Histogram::with_opts(
            HistogramOpts::new("xccl_rendezvous_seconds", "Time spent exchanging root ids")
                .buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0, 60.0]),
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(rendezvous_time.clone()))
            .expect("metric registered once");

        let task_wait_time = Histogram::with_opts(
            HistogramOpts::new("xccl_task_wait_seconds", "Host time blocked in task waits")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(task_wait_time.clone()))
            .expect("metric registered once");

        let wait_timeouts = Counter::with_opts(Opts::new(
            "xccl_wait_timeouts_total",
            "Task waits that exceeded their deadline",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(wait_timeouts.clone()))
            .expect("metric registered once");

        Self {
            registry,
            collectives_total,
            communicator_inits,
            rendezvous_time,
            task_wait_time,
            wait_timeouts,
        }
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics registry.
pub fn get_metrics() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(MetricsRegistry::new)
}

pub fn record_collective(op: &str) {
    get_metrics().collectives_total.with_label_values(&[op]).inc();
}

pub fn record_communicator_init(rendezvous_secs: f64) {
    let m = get_metrics();
    m.communicator_inits.inc();
    m.rendezvous_time.observe(rendezvous_secs);
}

pub fn record_task_wait(duration_secs: f64, timed_out: bool) {
    let m = get_metrics();
    m.task_wait_time.observe(duration_secs);
    if timed_out {
        m.wait_timeouts.inc();
    }
}

/// Start a simple HTTP server to expose metrics on the given port.
#[cfg(feature = "metrics-server")]
pub async fn start_metrics_server(port: u16) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Metrics server started");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics = get_metrics().gather();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics.len(),
                metrics
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}
