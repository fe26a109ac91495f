//! cacheguard soak harness
//!
//! Drives a simulated authoritative store through [`CacheInterceptor`] with
//! concurrent readers and writers, optionally behind a shared in-memory
//! remote tier with injected faults, and prints the final metrics.
//!
//! ```text
//! ┌──────────┐   read_through   ┌─────────────┐   loader   ┌──────────────┐
//! │ readers  │ ───────────────▶ │ CacheEngine │ ─────────▶ │  simulated   │
//! │ writers  │ ── mutate ─────▶ │  (+remote)  │            │    store     │
//! └──────────┘                  └─────────────┘            └──────────────┘
//!                                      │
//!                         /metrics, /healthz (hyper)
//! ```

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cacheguard::monitoring::{HealthResponse, PrometheusExporter};
use cacheguard::{
    CacheEngine, CacheInterceptor, EngineConfig, InMemoryRemoteBackend, MetricsSnapshot,
    OperationContext, OperationKind, RelationConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Soak harness for the cacheguard engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration (YAML)
    #[arg(long, env = "CACHEGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Relation configuration (YAML)
    #[arg(long, env = "CACHEGUARD_RELATIONS")]
    relations: Option<PathBuf>,

    /// Concurrent reader tasks
    #[arg(long, env = "READERS", default_value = "32")]
    readers: usize,

    /// Concurrent writer tasks
    #[arg(long, env = "WRITERS", default_value = "2")]
    writers: usize,

    /// Run time in seconds
    #[arg(long, env = "DURATION_SECONDS", default_value = "10")]
    duration_seconds: u64,

    /// Distinct products in the simulated store
    #[arg(long, env = "KEYSPACE", default_value = "200")]
    keyspace: usize,

    /// Share of reads that ask for ids that do not exist
    #[arg(long, env = "ABSENT_RATIO", default_value = "0.1")]
    absent_ratio: f64,

    /// Latency of the simulated store in milliseconds
    #[arg(long, env = "STORE_LATENCY_MS", default_value = "20")]
    store_latency_ms: u64,

    /// Put an in-memory remote tier behind the local one
    #[arg(long, env = "REMOTE")]
    remote: bool,

    /// Latency injected into every remote call in milliseconds
    #[arg(long, env = "REMOTE_LATENCY_MS")]
    remote_latency_ms: Option<u64>,

    /// Seconds after start at which the remote tier goes down
    #[arg(long, env = "FAULT_AFTER_SECONDS")]
    fault_after_seconds: Option<u64>,

    /// How long the remote tier stays down
    #[arg(long, env = "FAULT_SECONDS", default_value = "3")]
    fault_seconds: u64,

    /// Metrics server bind address (disabled when unset)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting cacheguard soak harness");
    info!("  Readers/writers: {}/{}", args.readers, args.writers);
    info!("  Duration: {} seconds", args.duration_seconds);
    info!("  Keyspace: {}", args.keyspace);
    info!("  Remote tier: {}", args.remote);

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let relations = match &args.relations {
        Some(path) => RelationConfig::from_file(path)
            .with_context(|| format!("loading relations {}", path.display()))?,
        None => RelationConfig::new().relate("Product", "Category", "Category:id:{category}"),
    };

    let mut builder = CacheEngine::builder().config(config).relations(relations);
    let backend = args.remote.then(|| Arc::new(InMemoryRemoteBackend::new()));
    if let Some(backend) = &backend {
        backend.set_latency(args.remote_latency_ms.map(Duration::from_millis));
        builder = builder.remote(Arc::clone(backend) as Arc<dyn cacheguard::RemoteBackend>);
    }
    let engine = builder.build()?;
    let sweeper = engine.spawn_sweeper();
    let interceptor = CacheInterceptor::new(engine.clone());

    if let Some(addr) = args.metrics_addr.clone() {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, engine).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let store = Arc::new(SimulatedStore::new(
        args.keyspace,
        Duration::from_millis(args.store_latency_ms),
    ));
    let token = CancellationToken::new();
    let stats = Arc::new(WorkloadStats::default());

    if let (Some(backend), Some(after)) = (&backend, args.fault_after_seconds) {
        let backend = Arc::clone(backend);
        let outage = Duration::from_secs(args.fault_seconds);
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(after)) => {}
            }
            warn!(seconds = outage.as_secs(), "injecting remote tier outage");
            backend.set_unavailable(true);
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(outage) => {}
            }
            backend.set_unavailable(false);
            info!("remote tier restored");
        });
    }

    let mut workers = Vec::with_capacity(args.readers + args.writers);
    for _ in 0..args.readers {
        workers.push(tokio::spawn(reader(
            interceptor.clone(),
            Arc::clone(&store),
            Arc::clone(&stats),
            token.clone(),
            args.absent_ratio,
        )));
    }
    for _ in 0..args.writers {
        workers.push(tokio::spawn(writer(
            interceptor.clone(),
            Arc::clone(&store),
            Arc::clone(&stats),
            token.clone(),
        )));
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_seconds)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    token.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            error!("worker panicked: {}", e);
        }
    }

    engine.flush_invalidations().await;
    let replayed = engine.invalidation().replay_failed().await?;
    engine.shutdown().await;
    if let Some(sweeper) = sweeper {
        sweeper.await.context("sweep task")?;
    }

    let report = SoakReport {
        reads: stats.reads.load(Ordering::Relaxed),
        read_errors: stats.read_errors.load(Ordering::Relaxed),
        writes: stats.writes.load(Ordering::Relaxed),
        store_loads: store.loads.load(Ordering::Relaxed),
        replayed_invalidations: replayed,
        metrics: engine.metrics(),
        health: engine.health(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!("Soak run complete");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

const CATEGORIES: u64 = 8;

/// Stand-in for the authoritative database
struct SimulatedStore {
    products: DashMap<String, u64>,
    latency: Duration,
    loads: AtomicU64,
}

impl SimulatedStore {
    fn new(keyspace: usize, latency: Duration) -> Self {
        let products = (0..keyspace)
            .map(|i| (format!("p-{}", i), 100 + i as u64))
            .collect();
        Self {
            products,
            latency,
            loads: AtomicU64::new(0),
        }
    }

    fn product_id(&self, n: usize) -> String {
        format!("p-{}", n % self.products.len().max(1))
    }

    fn category_of(id: &str) -> u64 {
        id.bytes().map(u64::from).sum::<u64>() % CATEGORIES
    }

    async fn product(&self, id: &str) -> anyhow::Result<Option<Bytes>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        Ok(self.products.get(id).map(|price| {
            Bytes::from(
                json!({ "id": id, "price": *price, "category": Self::category_of(id) }).to_string(),
            )
        }))
    }

    async fn category(&self, category: u64) -> anyhow::Result<Option<Bytes>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        let count = self
            .products
            .iter()
            .filter(|p| Self::category_of(p.key()) == category)
            .count();
        Ok(Some(Bytes::from(json!({ "id": category, "products": count }).to_string())))
    }

    async fn total_price(&self) -> anyhow::Result<Option<Bytes>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency * 2).await;
        let total: u64 = self.products.iter().map(|p| *p.value()).sum();
        Ok(Some(Bytes::from(total.to_string())))
    }

    async fn update_price(&self, id: &str, price: u64) -> anyhow::Result<()> {
        tokio::time::sleep(self.latency).await;
        match self.products.get_mut(id) {
            Some(mut entry) => {
                *entry = price;
                Ok(())
            }
            None => anyhow::bail!("product {} does not exist", id),
        }
    }
}

#[derive(Default)]
struct WorkloadStats {
    reads: AtomicU64,
    read_errors: AtomicU64,
    writes: AtomicU64,
}

#[derive(Serialize)]
struct SoakReport {
    reads: u64,
    read_errors: u64,
    writes: u64,
    store_loads: u64,
    replayed_invalidations: usize,
    metrics: MetricsSnapshot,
    health: HealthResponse,
}

enum ReadKind {
    Product(String),
    Missing(String),
    Category(u64),
    Total,
}

async fn reader(
    cache: CacheInterceptor,
    store: Arc<SimulatedStore>,
    stats: Arc<WorkloadStats>,
    token: CancellationToken,
    absent_ratio: f64,
) {
    while !token.is_cancelled() {
        let (kind, pause) = {
            let mut rng = rand::thread_rng();
            let roll: f64 = rng.gen();
            // Skew towards a hot set so keys actually collide
            let n = if rng.gen_bool(0.8) {
                rng.gen_range(0..16)
            } else {
                rng.gen_range(0..usize::MAX / 2)
            };
            let kind = if roll < absent_ratio {
                ReadKind::Missing(format!("missing-{}", n % 64))
            } else if roll < absent_ratio + 0.05 {
                ReadKind::Total
            } else if roll < absent_ratio + 0.15 {
                ReadKind::Category(n as u64 % CATEGORIES)
            } else {
                ReadKind::Product(store.product_id(n))
            };
            (kind, Duration::from_millis(rng.gen_range(1..5)))
        };

        let store = Arc::clone(&store);
        let result = match kind {
            ReadKind::Product(id) | ReadKind::Missing(id) => {
                let ctx = OperationContext::point_lookup("Product", id.clone());
                cache.read_through(&ctx, move || async move { store.product(&id).await }).await
            }
            ReadKind::Category(category) => {
                let ctx = OperationContext::point_lookup("Category", category);
                cache
                    .read_through(&ctx, move || async move { store.category(category).await })
                    .await
            }
            ReadKind::Total => {
                let ctx = OperationContext::aggregate("Product", ["sum", "price"]);
                cache.read_through(&ctx, move || async move { store.total_price().await }).await
            }
        };

        stats.reads.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = result {
            stats.read_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "read failed");
        }
        tokio::time::sleep(pause).await;
    }
}

async fn writer(
    cache: CacheInterceptor,
    store: Arc<SimulatedStore>,
    stats: Arc<WorkloadStats>,
    token: CancellationToken,
) {
    while !token.is_cancelled() {
        let (id, price, pause) = {
            let mut rng = rand::thread_rng();
            let id = store.product_id(rng.gen_range(0..32));
            (id, rng.gen_range(50..500), Duration::from_millis(rng.gen_range(50..150)))
        };
        let payload = json!({
            "id": id,
            "price": price,
            "category": SimulatedStore::category_of(&id),
        });
        let ctx = OperationContext::mutation(OperationKind::Update, "Product", payload);

        match cache.mutate(&ctx, store.update_price(&id, price)).await {
            Ok(()) => {
                stats.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, product = %id, "update failed"),
        }
        tokio::time::sleep(pause).await;
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    // Reports go to stdout; keep logs on stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, engine: CacheEngine) -> cacheguard::Result<()> {
    use http_body_util::Full;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        if let Ok(value) = HeaderValue::from_str(content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        response
    }

    async fn handle(
        req: Request<hyper::body::Incoming>,
        engine: CacheEngine,
        exporter: Arc<PrometheusExporter>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let health = engine.health();
                match exporter.render(&engine.metrics(), Some(&health)) {
                    Ok(text) => respond(StatusCode::OK, &exporter.content_type(), text),
                    Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
                }
            }
            "/healthz" => {
                let health = engine.health();
                let status = if health.status.serves_reads() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                match serde_json::to_vec(&health) {
                    Ok(body) => respond(status, "application/json", body),
                    Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| cacheguard::Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;
    let exporter = Arc::new(PrometheusExporter::default());

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let engine = engine.clone();
        let exporter = Arc::clone(&exporter);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, engine.clone(), Arc::clone(&exporter)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
