//! Unified Replication Operator - discovery agent
//!
//! Discovers installed replication backends, keeps their capabilities and
//! health current, and serves liveness/readiness endpoints.
//!
//! ```text
//!   ┌────────────────┐   ┌────────────────────┐   ┌────────────────┐
//!   │ Resource Store │──▶│ Enhanced Discovery │──▶│   Capability   │
//!   │ (kube/fixture) │   │  (auto-refresh)    │   │   Registry     │
//!   └────────────────┘   └────────────────────┘   └───────▲────────┘
//!                                                         │
//!                          ┌──────────────┐       ┌───────┴────────┐
//!                          │ /healthz     │◀──────│ Health Monitor │
//!                          │ /readyz      │       └────────────────┘
//!                          └──────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use unified_replication_operator::domain::ports::ResourceStoreRef;
use unified_replication_operator::{
    Backend, CapabilityRegistry, DiscoveryConfig, DiscoveryEngine, EnhancedDiscoveryConfig,
    EnhancedDiscoveryEngine, Error, HealthMonitor, HealthMonitorConfig, KubeResourceStore,
    MemoryResourceStore, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Unified Replication Operator - backend discovery and capability agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// YAML fixture seeding the in-memory store in standalone mode
    #[arg(long, env = "FIXTURE")]
    fixture: Option<PathBuf>,

    /// Backends to detect
    #[arg(
        long,
        env = "BACKENDS",
        value_delimiter = ',',
        default_value = "ceph,trident,powerstore"
    )]
    backends: Vec<String>,

    /// Per-backend discovery timeout in seconds
    #[arg(long, env = "DISCOVERY_TIMEOUT", default_value = "30")]
    discovery_timeout_secs: u64,

    /// Discovery retries after the first failure
    #[arg(long, env = "DISCOVERY_RETRIES", default_value = "3")]
    discovery_retries: u32,

    /// Discovery cache TTL in seconds
    #[arg(long, env = "CACHE_TTL", default_value = "300")]
    cache_ttl_secs: u64,

    /// Discovery and capability auto-refresh interval in seconds (keep below the cache TTL)
    #[arg(long, env = "REFRESH_INTERVAL", default_value = "240")]
    refresh_interval_secs: u64,

    /// Require controller deployments to be ready
    #[arg(long, env = "CHECK_CONTROLLERS", default_value_t = true, action = clap::ArgAction::Set)]
    check_controllers: bool,

    /// Health check interval in seconds
    #[arg(long, env = "HEALTH_INTERVAL", default_value = "30")]
    health_interval_secs: u64,

    /// Capability refresh interval in seconds
    #[arg(long, env = "CAPABILITY_REFRESH_INTERVAL", default_value = "300")]
    capability_refresh_secs: u64,

    /// Performance sampling interval in seconds (0 disables sampling)
    #[arg(long, env = "PERFORMANCE_INTERVAL", default_value = "600")]
    performance_interval_secs: u64,

    /// Concurrent backend checks
    #[arg(long, env = "MAX_CONCURRENT_CHECKS", default_value = "5")]
    max_concurrent_checks: usize,

    /// Per-check timeout in seconds
    #[arg(long, env = "CHECK_TIMEOUT", default_value = "10")]
    check_timeout_secs: u64,
}

impl Args {
    fn discovery_config(&self) -> Result<DiscoveryConfig> {
        let backends = self
            .backends
            .iter()
            .map(|b| b.trim().parse::<Backend>())
            .collect::<Result<Vec<_>>>()?;

        Ok(DiscoveryConfig {
            timeout: Duration::from_secs(self.discovery_timeout_secs),
            max_retries: self.discovery_retries,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            backends,
            check_controllers: self.check_controllers,
            ..Default::default()
        })
    }

    fn monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            health_check_interval: Duration::from_secs(self.health_interval_secs),
            capability_refresh_interval: Duration::from_secs(self.capability_refresh_secs),
            performance_interval: (self.performance_interval_secs > 0)
                .then(|| Duration::from_secs(self.performance_interval_secs)),
            max_concurrent_checks: self.max_concurrent_checks,
            check_timeout: Duration::from_secs(self.check_timeout_secs),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Unified Replication Operator");
    info!("  Version: {}", unified_replication_operator::VERSION);
    info!("  Health: {}", args.health_addr);
    info!("  Backends: {}", args.backends.join(","));
    info!("  Standalone mode: {}", args.standalone);

    let store = build_store(&args).await?;
    let cancel = CancellationToken::new();

    let discovery = DiscoveryEngine::new(args.discovery_config()?, store.clone());
    let registry = Arc::new(CapabilityRegistry::new());

    let enhanced = Arc::new(EnhancedDiscoveryEngine::new(
        EnhancedDiscoveryConfig {
            max_concurrent_checks: args.max_concurrent_checks,
            check_timeout: Duration::from_secs(args.check_timeout_secs),
            ..Default::default()
        },
        discovery.clone(),
        registry.clone(),
        store,
    ));

    match enhanced.discover_with_capabilities(&cancel).await {
        Ok(result) => {
            for (backend, outcome) in &result.discovery.backends {
                info!(
                    backend = %backend,
                    status = %outcome.status,
                    "Backend discovered"
                );
            }
            for (backend, err) in &result.errors {
                warn!(backend = %backend, error = %err, "Capability detection failed");
            }
            info!(
                available = result.discovery.available.len(),
                healthy = result.healthy_backends().len(),
                "Initial discovery complete"
            );
        }
        Err(e) => warn!(error = %e, "Initial discovery failed; relying on auto-refresh"),
    }

    enhanced.start_auto_refresh(&cancel)?;

    let monitor = HealthMonitor::new(args.monitor_config(), registry.clone());
    monitor.start(&cancel)?;

    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;
    let health = HealthState {
        enhanced: enhanced.clone(),
        cancel: cancel.clone(),
    };
    let server = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health).await {
            error!("Health server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    cancel.cancel();
    monitor.stop();
    enhanced.stop_auto_refresh();
    discovery.close();
    if let Err(e) = server.await {
        warn!(error = %e, "Health server task ended abnormally");
    }

    info!("Operator shutdown complete");
    Ok(())
}

async fn build_store(args: &Args) -> Result<ResourceStoreRef> {
    if args.standalone {
        let store = match &args.fixture {
            Some(path) => MemoryResourceStore::from_yaml_file(path)?,
            None => {
                warn!("Standalone mode without a fixture; no backends will be discovered");
                MemoryResourceStore::new()
            }
        };
        return Ok(Arc::new(store));
    }

    let store = KubeResourceStore::try_default().await?;
    info!("Connected to Kubernetes API server");
    Ok(Arc::new(store))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

#[derive(Clone)]
struct HealthState {
    enhanced: Arc<EnhancedDiscoveryEngine>,
    cancel: CancellationToken,
}

fn respond(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, state: HealthState) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let shutdown = state.cancel.clone();

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" => {
                            if state.enhanced.is_ready() {
                                respond(StatusCode::OK, "ok")
                            } else {
                                respond(StatusCode::SERVICE_UNAVAILABLE, "not ready")
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}
