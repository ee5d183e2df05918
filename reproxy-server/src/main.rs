// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  reproxy — dynamic HTTP/HTTPS reverse proxy
//
//  Architecture: monoio thread-per-core data plane + a tokio control-plane
//  thread for discovery, health checks, and TLS/ACME lifecycle management.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use reproxy_core::cert::TlsMode;
use reproxy_core::config::ReproxyConfig;
use reproxy_discovery::provider::Provider;
use reproxy_discovery::service::DiscoveryService;
use reproxy_observability::metrics::Metrics;
use reproxy_proxy::worker::{self, SharedState};
use reproxy_tls::TlsManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "reproxy", version, about = "reproxy — dynamic HTTP/HTTPS reverse proxy")]
struct Cli {
    /// Path to a YAML configuration file. Falls back to `reproxy.yml`/`reproxy.yaml` in the
    /// working directory, then `/etc/reproxy/reproxy.yml`, then built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "reproxy starting");

    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().to_string());
    let config = ReproxyConfig::load(config_path.as_deref())?;
    let config = Arc::new(config);

    let num_workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    info!(workers = num_workers, "worker count");

    let metrics = Arc::new(Metrics::new()?);

    // Concrete discovery-provider backends (Docker, Consul, file watchers) are an integration
    // seam the operator fills in by implementing `reproxy_discovery::Provider`; none ship here.
    let providers: Vec<Arc<dyn Provider>> = Vec::new();
    let debounce = Duration::from_millis(config.proxy.debounce_ms);
    let health_interval = Duration::from_secs(config.proxy.health_interval_secs);
    let (discovery, table_changed) = DiscoveryService::new(providers, debounce, health_interval);
    let discovery = Arc::new(discovery);
    let table_handle = discovery.table_handle();

    // When TLS is enabled, `proxy.listen` is the HTTPS bind address served by the tokio-based
    // TLS listener (see `run_tls`) rather than by the monoio plaintext workers — the two would
    // otherwise race to bind the same address.
    let worker_handles = if config.ssl.r#type == TlsMode::None {
        let shared = SharedState::new(table_handle.clone(), table_changed, Arc::clone(&config), Arc::clone(&metrics));
        worker::spawn_workers(shared, num_workers)
    } else {
        drop(table_changed);
        Vec::new()
    };

    let cancel = CancellationToken::new();

    let control_plane = spawn_control_plane(Arc::clone(&config), Arc::clone(&discovery), Arc::clone(&metrics), table_handle, cancel.clone());

    info!(proxy_addr = %config.proxy.listen, "reproxy is ready — serving traffic");

    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutdown signal received, stopping");
    cancel.cancel();
    let _ = control_plane.join();

    // monoio workers run an unbounded accept loop with no cancellation hook (same limitation
    // as the upstream teacher code); the OS reclaims their threads on process exit.
    drop(worker_handles);

    info!("reproxy stopped");
    Ok(())
}

/// Spawn the tokio control-plane thread: discovery run loop, health scheduler, and (when TLS is
/// enabled) the HTTPS listener plus its companion plaintext redirect/ACME-challenge listener.
/// Kept off the monoio worker threads entirely — none of this touches the hot request path.
fn spawn_control_plane(
    config: Arc<ReproxyConfig>,
    discovery: Arc<DiscoveryService>,
    metrics: Arc<Metrics>,
    table_handle: Arc<arc_swap::ArcSwap<reproxy_discovery::table::RuleTable>>,
    cancel: CancellationToken,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("reproxy-control".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime for control plane");

            rt.block_on(async move {
                let health_handle = discovery.schedule_health_check(cancel.clone());

                let discovery_cancel = cancel.clone();
                let discovery_for_run = Arc::clone(&discovery);
                let discovery_task = tokio::spawn(async move { discovery_for_run.run(discovery_cancel).await });

                if config.ssl.r#type != TlsMode::None {
                    if let Err(e) = run_tls(Arc::clone(&config), table_handle, metrics, cancel.clone()).await {
                        tracing::error!(error = %e, "TLS lifecycle manager failed to start");
                    }
                }

                cancel.cancelled().await;
                discovery_task.abort();
                health_handle.abort();
            });
        })
        .expect("failed to spawn control-plane thread")
}

async fn run_tls(
    config: Arc<ReproxyConfig>,
    table_handle: Arc<arc_swap::ArcSwap<reproxy_discovery::table::RuleTable>>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let known_fqdns = if config.ssl.fqdn.is_empty() && config.ssl.r#type == TlsMode::Auto {
        harvest_fqdns(&table_handle).await
    } else {
        Vec::new()
    };

    // No concrete DNS-01 registrar integration ships here (see reproxy_tls::dns01::DnsProvider);
    // auto mode without one falls back to HTTP-01 challenges only.
    let tls_manager = Arc::new(TlsManager::new(&config.ssl, known_fqdns.clone(), None).await?);

    let fqdns = if config.ssl.fqdn.is_empty() { known_fqdns } else { config.ssl.fqdn.clone() };
    tls_manager.spawn_renewal(fqdns, cancel.clone());

    let redirect_addr: SocketAddr = format!("0.0.0.0:{}", tls_manager.http_port()).parse()?;
    let redirect_tls = Arc::clone(&tls_manager);
    tokio::spawn(async move {
        if let Err(e) = reproxy_proxy::tls_listener::run_redirect_listener(redirect_addr, redirect_tls).await {
            tracing::error!(error = %e, "http redirect listener failed");
        }
    });

    let https_proxy = Arc::new(Mutex::new(reproxy_proxy::proxy::ProxyWorker::new(table_handle, Arc::clone(&config))));
    let https_addr = config.proxy.listen;
    tokio::spawn(async move {
        if let Err(e) = reproxy_proxy::tls_listener::run_tls_listener(https_addr, tls_manager, https_proxy, metrics).await {
            tracing::error!(error = %e, "https listener failed");
        }
    });

    Ok(())
}

/// Harvest FQDNs from whatever rules discovery has already published, polling for up to five
/// seconds. Used to seed ACME issuance when `ssl.fqdn` is left empty in auto mode.
async fn harvest_fqdns(table_handle: &Arc<arc_swap::ArcSwap<reproxy_discovery::table::RuleTable>>) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let servers = table_handle.load().servers();
        if !servers.is_empty() || tokio::time::Instant::now() >= deadline {
            return servers;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn setup_signal_handler() {
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
