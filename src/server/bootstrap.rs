use crate::config::GatewayConfig;
use crate::server::{self, runtime};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
    pub json_logs: bool,
}

/// Build a container-sized runtime and drive the gateway lifecycle on it.
/// Kept out of `main()` so the binary stays a thin argument parser.
pub fn launch(args: BootstrapArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(runtime::get_container_cpu_limit())
        .enable_all()
        .build()?;
    runtime.block_on(run(args))
}

/// Gateway lifecycle: init → build state → spawn loop owners → serve →
/// drain on signal.
async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing(args.json_logs);

    let config = GatewayConfig::load(&args.config_path)?;
    let state = server::GatewayState::new(config)?;
    log_collaborators(&state);

    let shutdown = Arc::new(Notify::new());
    spawn_janitor(&state, &shutdown);
    spawn_admin(&state, &args);

    tracing::info!("server: starting gateway, listen={}", args.listen);
    let gateway = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_gateway_server(&listen, state, shutdown).await }
    });

    let signal = shutdown_signal().await;
    tracing::info!("server: received {}, shutting down", signal);
    shutdown.notify_waiters();

    if let Err(e) = gateway.await {
        tracing::error!("server: gateway task error: {}", e);
    }
    tracing::info!("server: shutdown complete");
    Ok(())
}

/// Absent collaborators degrade specific paths rather than failing boot;
/// say so once at startup instead of per-request.
fn log_collaborators(state: &server::GatewayState) {
    if state.browser.is_none() {
        tracing::info!("browser: no rendering engine configured; browser-only sites will fail fast");
    }
    match (&state.proxy, state.proxy_pool.len()) {
        (None, 0) => {
            tracing::info!("proxy: no PROXY_URL/PROXY_POOL configured; proxied retries disabled")
        }
        (_, n) if n > 0 => tracing::info!("proxy: pool active, size={}", n),
        _ => tracing::info!("proxy: single proxy configured"),
    }
}

fn init_tracing(json: bool) {
    let (writer, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());
    // The guard must outlive the process or buffered lines are dropped.
    std::mem::forget(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(base.json())
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(base).init();
    }
}

/// Expired cache entries are reclaimed on a fixed cadence so the in-process
/// store cannot grow without bound between organic accesses.
fn spawn_janitor(state: &server::GatewayState, shutdown: &Arc<Notify>) {
    const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

    let cache = state.cache.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown.notified() => return,
            }
            if let Some(ref cache) = cache {
                cache.prune();
            }
        }
    });
}

fn spawn_admin(state: &server::GatewayState, args: &BootstrapArgs) {
    let state = state.clone();
    let listen = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&listen, state).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

/// Resolve on SIGINT or SIGTERM, reporting which one fired.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
