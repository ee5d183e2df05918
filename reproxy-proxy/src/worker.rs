use arc_swap::ArcSwap;
use reproxy_core::config::ReproxyConfig;
use reproxy_discovery::table::RuleTable;
use reproxy_observability::metrics::Metrics;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{error, info};

use crate::proxy::{ConnPool, ProxyWorker};

/// Shared state across all worker threads.
///
/// The `ArcSwap<RuleTable>` is the only shared mutable state, published by the discovery
/// service (running on the side tokio thread) and read here via an atomic load. Every worker
/// also holds a clone of the `crossbeam_channel` receiver the discovery service broadcasts
/// rebuild notifications on — `crossbeam_channel` is MPMC, so each clone observes every send.
/// `metrics` is a single process-wide registry shared by `Arc`; its counters are lock-free
/// atomics, so concurrent increments from every worker thread need no additional coordination.
pub struct SharedState {
    pub table: Arc<ArcSwap<RuleTable>>,
    pub table_changed: crossbeam_channel::Receiver<()>,
    pub config: Arc<ReproxyConfig>,
    pub metrics: Arc<Metrics>,
}

impl SharedState {
    pub fn new(
        table: Arc<ArcSwap<RuleTable>>,
        table_changed: crossbeam_channel::Receiver<()>,
        config: Arc<ReproxyConfig>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self { table, table_changed, config, metrics })
    }
}

/// Spawn monoio worker threads — one per core.
///
/// Each thread runs an independent monoio runtime with its own TCP listener, event loop, and
/// proxy state. monoio relies on `SO_REUSEPORT` for multiple threads to share one listen
/// address; the OS load-balances accepted connections across them.
pub fn spawn_workers(shared: Arc<SharedState>, num_workers: usize) -> Vec<std::thread::JoinHandle<()>> {
    let listen_addr = shared.config.proxy.listen;
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let shared = Arc::clone(&shared);

        let handle = std::thread::Builder::new()
            .name(format!("reproxy-worker-{worker_id}"))
            .spawn(move || {
                let rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("failed to build monoio runtime");

                rt.block_on(worker_loop(worker_id, shared, listen_addr));
            })
            .expect("failed to spawn worker thread");

        handles.push(handle);
    }

    info!(workers = num_workers, addr = %listen_addr, "workers spawned");
    handles
}

/// Main loop for a single worker thread.
///
/// Creates ONE `ProxyWorker` and ONE `ConnPool` for this thread; every connection accepted here
/// shares them via `Rc<RefCell<_>>`. The pool is pre-warmed, against literal (non-templated)
/// upstream addresses only, before the listener starts accepting.
async fn worker_loop(worker_id: usize, shared: Arc<SharedState>, addr: SocketAddr) {
    use monoio::net::TcpListener;

    let listener = TcpListener::bind(addr).unwrap_or_else(|e| {
        panic!("worker {worker_id} failed to bind to {addr}: {e}");
    });

    info!(worker = worker_id, %addr, "worker listening");

    let proxy_inner = ProxyWorker::new(Arc::clone(&shared.table), Arc::clone(&shared.config));

    let pool_size = 32usize;
    let warm_addrs = proxy_inner.static_upstream_hosts();
    let mut pool_inner = ConnPool::new(pool_size);
    let warm_count = (pool_size / 2).max(4).min(pool_size);
    pool_inner.warm(&warm_addrs, warm_count).await;

    let proxy = Rc::new(RefCell::new(proxy_inner));
    let conn_pool = Rc::new(RefCell::new(pool_inner));

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);

                if shared.table_changed.try_recv().is_ok() {
                    proxy.borrow_mut().maybe_update_table();
                }

                let proxy = Rc::clone(&proxy);
                let pool = Rc::clone(&conn_pool);
                let metrics = Arc::clone(&shared.metrics);

                monoio::spawn(async move {
                    if let Err(e) = crate::connection::handle_connection(stream, peer_addr, proxy, pool, metrics).await
                    {
                        tracing::debug!(error = %e, "connection closed");
                    }
                });
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "accept error");
            }
        }
    }
}
