//! The client worker: a bounded pool of workers, each of which
//! authenticates one accepted TCP connection, binds it to a slot via
//! the scheduler, and drives the per-client frame loop until the
//! client disconnects.
//!
//! The pool reuses the generic [`Worker`] primitive a fourth time (the
//! fifth is the registration reporter): the listener hands an accepted
//! `TcpStream` to an idle worker. Unlike
//! [`crate::slot_pool::SlotPool`], which layers its own idle list on
//! top of slots that have no built-in idleness concept, a
//! [`Worker`]'s `Idle`/`Busy` state is already authoritative. A
//! second, separately-updated idle list here would race the worker's
//! own state transition (the worker could still be mid-body when an
//! external list already reports it free). `try_dispatch` instead
//! scans for an already-idle worker under a single dispatch lock, the
//! same serialize-then-scan shape `SlotPool::admit` uses.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::ProxyContext;
use crate::digest::{hex32_be, verify_password_response};
use crate::error::{ProxyError, Result};
use crate::frame::{write_frame, MessageType, SystemCode};
use crate::nonce::draw_nonce;
use crate::worker::{BodyFuture, Worker};

/// A pool of client workers, sized at `open()` time (defaults to the
/// slot count, since no more clients can ever be admitted than there
/// are slots to hold them).
pub struct ClientWorkerPool {
    workers: Vec<Mutex<Worker<TcpStream>>>,
    /// Serializes `try_dispatch` scans so two concurrent accepts never
    /// both pick the same idle worker.
    dispatch_lock: Mutex<()>,
}

impl ClientWorkerPool {
    /// Builds `count` placeholder workers. Call [`ClientWorkerPool::start`]
    /// once an `Arc<Self>` and a `ProxyContext` exist to install the
    /// real session body.
    pub fn new(count: usize) -> Arc<ClientWorkerPool> {
        let workers = (0..count)
            .map(|_| Mutex::new(Worker::spawn(|_: Option<TcpStream>| -> BodyFuture { Box::pin(async {}) }, None)))
            .collect();
        Arc::new(ClientWorkerPool { workers, dispatch_lock: Mutex::new(()) })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Replaces each placeholder worker with one whose body runs a
    /// full client session. Once the session ends the worker simply
    /// goes back to `Idle` (the primitive's own state transition,
    /// performed by [`Worker::spawn`]'s run loop), and that alone makes
    /// it visible to the next `try_dispatch` scan.
    pub async fn start(self: &Arc<Self>, ctx: Arc<ProxyContext>) {
        for index in 0..self.workers.len() {
            let ctx = ctx.clone();
            let worker = Worker::spawn(
                move |input: Option<TcpStream>| -> BodyFuture {
                    let ctx = ctx.clone();
                    Box::pin(async move {
                        if let Some(stream) = input {
                            run_client_session(ctx, stream).await;
                        }
                    })
                },
                None,
            );
            *self.workers[index].lock().await = worker;
        }
    }

    /// The listener-side half of admission: find an idle worker and
    /// hand it the accepted stream. Returns `false` (caller closes the
    /// connection) if none is idle.
    pub async fn try_dispatch(&self, stream: TcpStream) -> bool {
        let _guard = self.dispatch_lock.lock().await;
        let mut payload = Some(stream);
        for worker in &self.workers {
            let worker = worker.lock().await;
            if worker.is_idle() {
                let stream = payload.take().expect("payload only taken once, inside this loop");
                return worker.wake(stream).await.is_ok();
            }
        }
        false
    }

    /// Stops every worker. Used at server teardown.
    pub async fn stop_all(&self) {
        for worker in &self.workers {
            worker.lock().await.join().await;
        }
    }
}

/// One full client session: authenticate, admit to a slot, then loop
/// `slot.process()` until it errors. This is the work function behind
/// every [`ClientWorkerPool`] worker.
async fn run_client_session(ctx: Arc<ProxyContext>, mut stream: TcpStream) {
    let peer = stream.peer_addr().ok();

    let callsign = match authenticate(&ctx, &mut stream).await {
        Ok(callsign) => callsign,
        Err(e) => {
            if e.is_quiet_hangup() {
                debug!(?peer, "client disconnected during authentication");
            } else {
                debug!(?peer, error = %e, "authentication failed");
            }
            return;
        }
    };

    ctx.registration.update(ctx.slots.used().await, ctx.slots.total()).await;

    let (slot, mut read_half) = match ctx.slots.admit(stream, &callsign).await {
        Ok(pair) => pair,
        Err(e) => {
            info!(?peer, %callsign, error = %e, "no available slots, closing connection");
            return;
        }
    };

    loop {
        match slot.process(&mut read_half).await {
            Ok(()) => continue,
            Err(e) => {
                if e.is_quiet_hangup() {
                    info!(slot = slot.index, %callsign, "client disconnected");
                } else {
                    warn!(slot = slot.index, %callsign, error = %e, "client session ended with error");
                }
                break;
            }
        }
    }

    slot.finish().await;
    ctx.slots.release(&slot).await;
    ctx.registration.update(ctx.slots.used().await, ctx.slots.total()).await;
}

/// The nonce challenge / response exchange and the callsign filter
/// check. Returns the authenticated callsign on success.
async fn authenticate(ctx: &ProxyContext, stream: &mut TcpStream) -> Result<String> {
    let nonce = draw_nonce();
    let nonce_hex = hex32_be(nonce);
    stream.write_all(nonce_hex.as_bytes()).await.map_err(ProxyError::classify_peer_io)?;

    // First 16 bytes: enough to contain the longest legal callsign (10
    // chars) plus its newline, with room to spare before the response.
    let mut head = [0u8; 16];
    tokio::io::AsyncReadExt::read_exact(stream, &mut head).await.map_err(ProxyError::classify_peer_io)?;

    let search_len = head.len().min(11);
    let newline_index = head[..search_len]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| ProxyError::InvalidFrame("callsign not newline-terminated within 11 bytes".to_string()))?;

    // Total bytes needed: callsign + '\n' (newline_index + 1) + 16-byte response.
    let total_needed = newline_index + 1 + 16;
    let mut full = head.to_vec();
    if total_needed > full.len() {
        let mut rest = vec![0u8; total_needed - full.len()];
        tokio::io::AsyncReadExt::read_exact(stream, &mut rest).await.map_err(ProxyError::classify_peer_io)?;
        full.extend_from_slice(&rest);
    }

    let callsign = String::from_utf8_lossy(&full[..newline_index]).trim().to_string();
    let response = &full[full.len() - 16..];

    if !verify_password_response(&ctx.config.password, nonce, response) {
        send_system(stream, SystemCode::BadPassword).await?;
        return Err(ProxyError::PermissionDenied("bad password"));
    }

    if !ctx.callsign_filter.is_allowed(&callsign) {
        send_system(stream, SystemCode::AccessDenied).await?;
        return Err(ProxyError::PermissionDenied("callsign denied by filter"));
    }

    Ok(callsign)
}

async fn send_system(stream: &mut TcpStream, code: SystemCode) -> Result<()> {
    write_frame(stream, MessageType::System, 0, &[code as u8]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callsign_filter::CallsignFilter;
    use crate::config::{CallsignFilterConfig, ProxyConfig, RegistrationConfig, TimeoutConfig};
    use crate::frame::read_header;
    use crate::registration::RegistrationReporter;
    use crate::slot_pool::SlotPool;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn test_context(password: &str, allow: Option<&str>, deny: Option<&str>) -> Arc<ProxyContext> {
        let config = Arc::new(ProxyConfig {
            bind_address: None,
            port: 0,
            external_bind_address: Some(Ipv4Addr::new(127, 0, 0, 1)),
            additional_external_bind_addresses: vec![],
            password: password.to_string(),
            callsign_filter: CallsignFilterConfig { allow: allow.map(String::from), deny: deny.map(String::from) },
            registration: RegistrationConfig { interval_secs: 3600, ..Default::default() },
            timeouts: TimeoutConfig { connect_ms: 200, shutdown_secs: 1 },
            logging: Default::default(),
        });
        let slots = Arc::new(SlotPool::init(&config, Duration::from_millis(200)).await.unwrap());
        let filter = Arc::new(CallsignFilter::compile(&config.callsign_filter).unwrap());
        let registration = RegistrationReporter::init(config.registration.clone(), config.is_public(), config.port);
        ProxyContext::new(config, slots, filter, registration)
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn authenticate_accepts_correct_public_password() {
        let ctx = test_context("PUBLIC", Some("^KM0H$"), None).await;
        let (mut client, mut server) = connected_pair().await;

        let server_task = tokio::spawn(async move { authenticate(&ctx, &mut server).await.map(|cs| (cs, ctx)) });

        let mut nonce_buf = [0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut nonce_buf).await.unwrap();
        let nonce_hex = std::str::from_utf8(&nonce_buf).unwrap();
        let nonce = crate::digest::from_hex32(nonce_hex).unwrap();
        let response = crate::digest::password_response("PUBLIC", nonce);

        let mut payload = b"KM0H\n".to_vec();
        payload.extend_from_slice(&response);
        client.write_all(&payload).await.unwrap();

        let (callsign, _ctx) = server_task.await.unwrap().unwrap();
        assert_eq!(callsign, "KM0H");
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_password_with_system_frame() {
        let ctx = test_context("PUBLIC", None, None).await;
        let (mut client, mut server) = connected_pair().await;

        let server_task = tokio::spawn(async move { authenticate(&ctx, &mut server).await });

        let mut nonce_buf = [0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut nonce_buf).await.unwrap();

        let mut payload = b"KM0H\n".to_vec();
        payload.extend_from_slice(&[0u8; 16]);
        client.write_all(&payload).await.unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::PermissionDenied(_))));

        let header = read_header(&mut client).await.unwrap();
        assert_eq!(header.msg_type, MessageType::System);
        assert_eq!(header.size, 1);
        let mut code = [0u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut code).await.unwrap();
        assert_eq!(code[0], SystemCode::BadPassword as u8);
    }

    #[tokio::test]
    async fn authenticate_rejects_denied_callsign() {
        let ctx = test_context("PUBLIC", None, Some("^KM0H$")).await;
        let (mut client, mut server) = connected_pair().await;

        let server_task = tokio::spawn(async move { authenticate(&ctx, &mut server).await });

        let mut nonce_buf = [0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut nonce_buf).await.unwrap();
        let nonce_hex = std::str::from_utf8(&nonce_buf).unwrap();
        let nonce = crate::digest::from_hex32(nonce_hex).unwrap();
        let response = crate::digest::password_response("PUBLIC", nonce);

        let mut payload = b"KM0H\n".to_vec();
        payload.extend_from_slice(&response);
        client.write_all(&payload).await.unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::PermissionDenied(_))));

        let header = read_header(&mut client).await.unwrap();
        assert_eq!(header.msg_type, MessageType::System);
        let mut code = [0u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut code).await.unwrap();
        assert_eq!(code[0], SystemCode::AccessDenied as u8);
    }

    #[tokio::test]
    async fn authenticate_fails_without_newline_in_first_11_bytes() {
        let ctx = test_context("PUBLIC", None, None).await;
        let (mut client, mut server) = connected_pair().await;

        let server_task = tokio::spawn(async move { authenticate(&ctx, &mut server).await });

        let mut nonce_buf = [0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut nonce_buf).await.unwrap();

        // 16 bytes, no newline anywhere in the first 11.
        client.write_all(&[b'X'; 16]).await.unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::InvalidFrame(_))));
    }

    #[tokio::test]
    async fn client_worker_pool_dispatches_and_recycles() {
        let pool = ClientWorkerPool::new(1);
        assert_eq!(pool.len(), 1);
        let ctx = test_context("PUBLIC", None, None).await;
        pool.start(ctx).await;

        let (client, server) = connected_pair().await;
        drop(client);
        assert!(pool.try_dispatch(server).await);

        // Give the worker a moment to run the (immediately-failing,
        // since the client half was dropped) session and recycle
        // itself back to idle.
        let mut recycled = false;
        for _ in 0..50 {
            if pool.workers[0].lock().await.is_idle() {
                recycled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recycled, "worker should have returned to idle after session end");

        // And it should be usable again for a second connection.
        let (client2, server2) = connected_pair().await;
        drop(client2);
        assert!(pool.try_dispatch(server2).await);
    }
}
