pub mod admin;
pub mod bootstrap;
pub mod handler;
pub mod runtime;
pub mod sse;
mod state;

#[cfg(test)]
mod handler_tests;

pub use state::GatewayState;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    full_body(Bytes::new())
}

/// How long in-flight connections get to finish after shutdown is signalled.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Serve one accepted connection with the HTTP/1+2 auto builder.
async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    state: GatewayState,
) {
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { handler::handle_request(req, state, peer_addr).await }
    });

    let served = auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
        .serve_connection_with_upgrades(io, svc)
        .await;

    if let Err(e) = served {
        if !e.to_string().contains("connection closed") {
            error!("server: connection error, peer={}, error={}", peer_addr, e);
        }
    }
}

/// Run the main gateway listener. Connection tasks are tracked so that a
/// shutdown stops accepting, then waits up to `DRAIN_TIMEOUT` for the
/// tracker to empty.
pub async fn run_gateway_server(
    listen: &str,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: gateway listening, addr={}", addr);

    let connections = TaskTracker::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        connections.spawn(serve_connection(stream, peer_addr, state.clone()));
                    }
                    Err(e) => error!("server: accept failed, error={}", e),
                }
            }
            _ = shutdown.notified() => break,
        }
    }

    connections.close();
    if connections.len() > 0 {
        info!(
            "server: draining, {} connections in flight",
            connections.len()
        );
    }
    match tokio::time::timeout(DRAIN_TIMEOUT, connections.wait()).await {
        Ok(()) => info!("server: all connections drained"),
        Err(_) => info!(
            "server: drain timeout ({}s), {} connections abandoned",
            DRAIN_TIMEOUT.as_secs(),
            connections.len()
        ),
    }
    Ok(())
}

/// Run the admin listener (health, readiness, metrics, stats, rule swap).
/// No drain handling: admin requests are short and stateless.
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state).await }
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin connection error, error={}", e);
                }
            }
        });
    }
}
