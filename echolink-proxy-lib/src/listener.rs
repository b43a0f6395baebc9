//! The client-facing listener / acceptor: accepts TCP connections and
//! hands each one to an idle client worker.
//!
//! Cancellation is a `tokio::select!` between `listener.accept()` and
//! a shutdown `watch` channel, rather than shutting down the raw
//! listening socket to unblock a blocked accept call. Dropping the
//! `TcpListener` when the loop exits has the same externally-visible
//! effect: no further connections are accepted.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::ClientWorkerPool;
use crate::context::ProxyContext;

/// Runs the accept loop until `shutdown` is signalled. Each iteration
/// accepts one connection, then either dispatches it to an idle
/// worker or drops it with an info-level log.
pub async fn run(ctx: Arc<ProxyContext>, workers: Arc<ClientWorkerPool>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("listener shutting down, no longer accepting connections");
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => handle_accepted(&ctx, &workers, stream, peer).await,
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn handle_accepted(ctx: &Arc<ProxyContext>, workers: &Arc<ClientWorkerPool>, stream: tokio::net::TcpStream, peer: std::net::SocketAddr) {
    if !ctx.is_accepting() {
        info!(%peer, "server is shutting down, refusing new connection");
        drop(stream);
        return;
    }
    if !workers.try_dispatch(stream).await {
        info!(%peer, "no available worker, closing connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callsign_filter::CallsignFilter;
    use crate::config::{ProxyConfig, RegistrationConfig, TimeoutConfig};
    use crate::registration::RegistrationReporter;
    use crate::slot_pool::SlotPool;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::net::TcpStream;

    async fn test_context() -> Arc<ProxyContext> {
        let config = Arc::new(ProxyConfig {
            bind_address: None,
            port: 0,
            external_bind_address: Some(Ipv4Addr::new(127, 0, 0, 1)),
            additional_external_bind_addresses: vec![],
            password: "PUBLIC".to_string(),
            callsign_filter: Default::default(),
            registration: RegistrationConfig { interval_secs: 3600, ..Default::default() },
            timeouts: TimeoutConfig { connect_ms: 200, shutdown_secs: 1 },
            logging: Default::default(),
        });
        let slots = Arc::new(SlotPool::init(&config, Duration::from_millis(200)).await.unwrap());
        let filter = Arc::new(CallsignFilter::allow_all());
        let registration = RegistrationReporter::init(config.registration.clone(), config.is_public(), config.port);
        ProxyContext::new(config, slots, filter, registration)
    }

    #[tokio::test]
    async fn rejects_connections_once_not_accepting() {
        let ctx = test_context().await;
        let workers = ClientWorkerPool::new(1);
        workers.start(ctx.clone()).await;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run_task = tokio::spawn(run(ctx.clone(), workers.clone(), listener, shutdown_rx));

        ctx.stop_accepting();
        let mut client = TcpStream::connect(addr).await.unwrap();
        // The connection is accepted at the TCP level but immediately
        // dropped because `is_accepting()` is false; the peer should
        // observe EOF rather than any protocol bytes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut buf = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        assert_eq!(n, 0);

        shutdown_tx.send(true).unwrap();
        run_task.await.unwrap();
    }
}
