//! The per-slot engine: owns the three outbound sockets for one
//! external EchoLink address and runs the three forwarder pipelines
//! that relay them to whichever client is currently bound.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::frame::{
    self, address_to_ipv4, ipv4_to_address, stream_payload, write_frame, FrameHeader, MessageType, MAX_CHUNK,
};
use crate::worker::{BodyFuture, Worker};

const DIRECTORY_SERVICE_PORT: u16 = 5200;
const UDP_DATA_PORT: u16 = 5198;
const UDP_CONTROL_PORT: u16 = 5199;

/// Mutable state guarded by the slot's binding lock: which client (if
/// any) currently owns this slot, and the callsign last seen here
/// (kept after unbind so reconnects can match against it).
struct SlotBinding {
    bound: bool,
    last_callsign: String,
    peer: Option<std::net::SocketAddr>,
}

/// One virtual EchoLink endpoint. Exists for the whole server
/// lifetime; a client binds to it for the duration of one session.
pub struct Slot {
    pub index: usize,
    pub external_addr: Option<Ipv4Addr>,
    binding: RwLock<SlotBinding>,
    /// The bound client's write half. Acquiring this mutex around a
    /// single `write_frame` call is the send-mutex discipline every
    /// writer (three forwarders + the handler loop) must follow.
    send: Mutex<Option<OwnedWriteHalf>>,
    outbound_tcp: Mutex<Option<OwnedWriteHalf>>,
    /// Notified whenever the outbound TCP connection is torn down out
    /// from under `run_tcp_forwarder`, so its blocked `read_half.read()`
    /// doesn't wait on the directory service to close its end first.
    tcp_cancel: Notify,
    udp_data_sock: Arc<UdpSocket>,
    udp_control_sock: Arc<UdpSocket>,
    tcp_forwarder: Mutex<Worker<OwnedReadHalf>>,
    udp_data_forwarder: Mutex<Worker<()>>,
    udp_control_forwarder: Mutex<Worker<()>>,
    connect_timeout: Duration,
}

impl Slot {
    /// `init`: binds the two UDP sockets (and, if given, the TCP
    /// connect source) to `external_addr`, or the wildcard address if
    /// `None`. Spawns no threads/tasks of its own yet; call
    /// [`Slot::start`] for that.
    pub async fn init(index: usize, external_addr: Option<Ipv4Addr>, connect_timeout: Duration) -> Result<Arc<Slot>> {
        let bind_ip = external_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let udp_data_sock = Arc::new(UdpSocket::bind((bind_ip, UDP_DATA_PORT)).await?);
        let udp_control_sock = Arc::new(UdpSocket::bind((bind_ip, UDP_CONTROL_PORT)).await?);

        let slot = Arc::new(Slot {
            index,
            external_addr,
            binding: RwLock::new(SlotBinding { bound: false, last_callsign: String::new(), peer: None }),
            send: Mutex::new(None),
            outbound_tcp: Mutex::new(None),
            tcp_cancel: Notify::new(),
            udp_data_sock,
            udp_control_sock,
            tcp_forwarder: Mutex::new(Worker::spawn(|_: Option<OwnedReadHalf>| -> BodyFuture { Box::pin(async {}) }, None)),
            udp_data_forwarder: Mutex::new(Worker::spawn(|_: Option<()>| -> BodyFuture { Box::pin(async {}) }, None)),
            udp_control_forwarder: Mutex::new(Worker::spawn(|_: Option<()>| -> BodyFuture { Box::pin(async {}) }, None)),
            connect_timeout,
        });
        Ok(slot)
    }

    /// `start`: replaces the placeholder workers spawned by `init`
    /// with the real forwarder bodies, now that we can close over
    /// `Arc<Slot>`. Two-phase construction exists because a worker
    /// body needs a handle back to its own slot.
    pub async fn start(self: &Arc<Self>) {
        let tcp_slot = self.clone();
        let tcp_worker = Worker::spawn(
            move |input: Option<OwnedReadHalf>| -> BodyFuture {
                let slot = tcp_slot.clone();
                Box::pin(async move {
                    if let Some(read_half) = input {
                        slot.run_tcp_forwarder(read_half).await;
                    }
                })
            },
            None,
        );
        *self.tcp_forwarder.lock().await = tcp_worker;

        let udp_data_slot = self.clone();
        let udp_data_worker = Worker::spawn(
            move |_: Option<()>| -> BodyFuture {
                let slot = udp_data_slot.clone();
                Box::pin(async move { slot.run_udp_forwarder(Udp::Data).await })
            },
            None,
        );
        *self.udp_data_forwarder.lock().await = udp_data_worker;

        let udp_control_slot = self.clone();
        let udp_control_worker = Worker::spawn(
            move |_: Option<()>| -> BodyFuture {
                let slot = udp_control_slot.clone();
                Box::pin(async move { slot.run_udp_forwarder(Udp::Control).await })
            },
            None,
        );
        *self.udp_control_forwarder.lock().await = udp_control_worker;
    }

    /// Claims this slot for `client`. Fails `Busy` if already bound;
    /// with `reconnect_only`, additionally fails `Busy` unless
    /// `callsign` matches the slot's last occupant.
    pub async fn accept(
        self: &Arc<Self>,
        client: TcpStream,
        callsign: String,
        reconnect_only: bool,
    ) -> Result<OwnedReadHalf> {
        let mut binding = self.binding.write().await;
        if binding.bound {
            return Err(ProxyError::Busy);
        }
        if reconnect_only && binding.last_callsign != callsign {
            return Err(ProxyError::Busy);
        }
        let is_reconnect = binding.last_callsign == callsign && !binding.last_callsign.is_empty();
        let peer = client.peer_addr().ok();
        let (read_half, write_half) = client.into_split();

        binding.bound = true;
        binding.last_callsign = callsign.clone();
        binding.peer = peer;
        drop(binding);

        *self.send.lock().await = Some(write_half);

        info!(
            slot = self.index,
            callsign = %callsign,
            peer = ?peer,
            reconnect = is_reconnect,
            "client bound to slot"
        );

        let _ = self.udp_data_forwarder.lock().await.wake(()).await;
        let _ = self.udp_control_forwarder.lock().await.wake(()).await;

        Ok(read_half)
    }

    /// `process`: reads and dispatches exactly one client frame.
    /// Callers loop this until it returns an error, then call
    /// [`Slot::finish`].
    pub async fn process(self: &Arc<Self>, client_read: &mut OwnedReadHalf) -> Result<()> {
        let header = frame::read_header(client_read).await?;
        match header.msg_type {
            MessageType::TcpOpen => self.handle_tcp_open(header).await,
            MessageType::TcpData => self.handle_tcp_data(client_read, header).await,
            MessageType::TcpClose => self.handle_tcp_close().await,
            MessageType::UdpData => self.handle_udp(client_read, header, Udp::Data).await,
            MessageType::UdpControl => self.handle_udp(client_read, header, Udp::Control).await,
            MessageType::System | MessageType::TcpStatus => {
                Err(ProxyError::InvalidFrame("SYSTEM/TCP_STATUS are proxy-to-client only".to_string()))
            }
        }
    }

    async fn handle_tcp_open(self: &Arc<Self>, header: FrameHeader) -> Result<()> {
        let addr = address_to_ipv4(header.address);

        *self.outbound_tcp.lock().await = None;
        self.tcp_cancel.notify_waiters();
        self.tcp_forwarder.lock().await.wait_idle().await.ok();

        let connect_result =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect((addr, DIRECTORY_SERVICE_PORT))).await;

        match connect_result {
            Ok(Ok(stream)) => {
                let (read_half, write_half) = stream.into_split();
                *self.outbound_tcp.lock().await = Some(write_half);
                let _ = self.tcp_forwarder.lock().await.wake(read_half).await;
                self.send_frame(MessageType::TcpStatus, 0, &0i32.to_ne_bytes()).await
            }
            Ok(Err(e)) => {
                warn!(slot = self.index, %addr, error = %e, "outbound TCP_OPEN failed");
                let code = e.raw_os_error().unwrap_or(-1);
                self.send_frame(MessageType::TcpStatus, 0, &code.to_ne_bytes()).await
            }
            Err(_elapsed) => {
                warn!(slot = self.index, %addr, "outbound TCP_OPEN timed out");
                self.send_frame(MessageType::TcpStatus, 0, &(-1i32).to_ne_bytes()).await
            }
        }
    }

    /// On an outbound write failure, the remaining client bytes are
    /// still drained (so the client's stream stays frame-aligned)
    /// before the outbound TCP is closed and a single
    /// TCP_CLOSE is sent. `on_chunk` therefore never returns `Err` for
    /// an outbound failure; only a genuine client-read error aborts
    /// `stream_payload` early.
    async fn handle_tcp_data(self: &Arc<Self>, client_read: &mut OwnedReadHalf, header: FrameHeader) -> Result<()> {
        let failed = std::cell::Cell::new(false);
        stream_payload(client_read, header.size, |chunk| {
            let slot = self.clone();
            let failed = &failed;
            async move {
                if failed.get() {
                    return Ok(());
                }
                let mut guard = slot.outbound_tcp.lock().await;
                if let Some(write_half) = guard.as_mut() {
                    if write_half.write_all(&chunk).await.is_err() {
                        *guard = None;
                        failed.set(true);
                    }
                }
                Ok(())
            }
        })
        .await?;

        if failed.get() {
            *self.outbound_tcp.lock().await = None;
            self.send_frame(MessageType::TcpClose, 0, &[]).await?;
        }
        Ok(())
    }

    async fn handle_tcp_close(self: &Arc<Self>) -> Result<()> {
        *self.outbound_tcp.lock().await = None;
        self.tcp_cancel.notify_waiters();
        Ok(())
    }

    async fn handle_udp(self: &Arc<Self>, client_read: &mut OwnedReadHalf, header: FrameHeader, which: Udp) -> Result<()> {
        let peer_ip = address_to_ipv4(header.address);
        let port = which.port();
        let socket = which.socket(self);
        stream_payload(client_read, header.size, |chunk| {
            let socket = socket.clone();
            async move {
                if let Err(e) = socket.send_to(&chunk, (peer_ip, port)).await {
                    warn!(error = %e, %peer_ip, "udp send failed, dropping chunk");
                }
                Ok(())
            }
        })
        .await
    }

    /// Sends a frame to the bound client under the send-mutex. The
    /// mutex spans exactly this call.
    async fn send_frame(&self, msg_type: MessageType, address: u32, payload: &[u8]) -> Result<()> {
        let mut guard = self.send.lock().await;
        if let Some(write_half) = guard.as_mut() {
            write_frame(write_half, msg_type, address, payload).await
        } else {
            Ok(())
        }
    }

    /// Drops the bound client (if any), closes all three outbound
    /// sockets, and waits for the forwarders to drain back to idle.
    /// Does not stop the forwarder tasks themselves (see `stop`).
    pub async fn finish(self: &Arc<Self>) {
        {
            let mut binding = self.binding.write().await;
            binding.bound = false;
            binding.peer = None;
        }
        *self.send.lock().await = None;
        *self.outbound_tcp.lock().await = None;
        self.tcp_cancel.notify_waiters();

        self.tcp_forwarder.lock().await.wait_idle().await.ok();
        self.udp_data_forwarder.lock().await.wait_idle().await.ok();
        self.udp_control_forwarder.lock().await.wait_idle().await.ok();
    }

    /// Shuts down the bound client's write half, which in turn makes
    /// the next `recv` on the (separately-owned) read half fail.
    /// Outbound sockets are left untouched.
    pub async fn drop_client(&self) {
        if let Some(write_half) = self.send.lock().await.as_mut() {
            let _ = write_half.shutdown().await;
        }
    }

    /// `stop`: `finish()` plus joining the three forwarder tasks.
    /// Used only at server teardown.
    pub async fn stop(self: &Arc<Self>) {
        self.finish().await;
        self.tcp_forwarder.lock().await.join().await;
        self.udp_data_forwarder.lock().await.join().await;
        self.udp_control_forwarder.lock().await.join().await;
    }

    pub async fn is_bound(&self) -> bool {
        self.binding.read().await.bound
    }

    pub async fn last_callsign(&self) -> String {
        self.binding.read().await.last_callsign.clone()
    }

    async fn run_tcp_forwarder(self: &Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; MAX_CHUNK];
        loop {
            let cancelled = self.tcp_cancel.notified();
            tokio::pin!(cancelled);
            tokio::select! {
                biased;
                _ = &mut cancelled => break,
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if self.send_frame(MessageType::TcpData, 0, &buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        *self.outbound_tcp.lock().await = None;
        let _ = self.send_frame(MessageType::TcpClose, 0, &[]).await;
    }

    async fn run_udp_forwarder(self: &Arc<Self>, which: Udp) {
        let socket = which.socket(self);
        let mut buf = vec![0u8; MAX_CHUNK];
        let msg_type = which.message_type();
        loop {
            if !self.is_bound().await {
                break;
            }
            match tokio::time::timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await {
                Ok(Ok((n, src))) => {
                    let address = match src.ip() {
                        std::net::IpAddr::V4(v4) => ipv4_to_address(v4),
                        std::net::IpAddr::V6(_) => continue,
                    };
                    if self.send_frame(msg_type, address, &buf[..n]).await.is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    if is_persistent_udp_error(&e) {
                        warn!(slot = self.index, error = %e, "persistent udp receive failure, dropping client");
                        self.drop_client().await;
                        break;
                    }
                    debug!(slot = self.index, error = %e, "transient udp receive error");
                }
                Err(_timeout) => continue,
            }
        }
    }
}

/// Benign receive errors (`ECONNRESET`/`EINTR`/`ENOTCONN`/`EPIPE`, typically
/// raised by an ICMP port-unreachable bouncing off a prior `send_to`) are
/// left for the next iteration to retry; anything else is treated as a
/// persistent failure and drops the client.
fn is_persistent_udp_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    !matches!(e.kind(), ConnectionReset | Interrupted | NotConnected | BrokenPipe)
}

#[derive(Clone, Copy)]
enum Udp {
    Data,
    Control,
}

impl Udp {
    fn port(self) -> u16 {
        match self {
            Udp::Data => UDP_DATA_PORT,
            Udp::Control => UDP_CONTROL_PORT,
        }
    }

    fn message_type(self) -> MessageType {
        match self {
            Udp::Data => MessageType::UdpData,
            Udp::Control => MessageType::UdpControl,
        }
    }

    fn socket(self, slot: &Slot) -> Arc<UdpSocket> {
        match self {
            Udp::Data => slot.udp_data_sock.clone(),
            Udp::Control => slot.udp_control_sock.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_binds_udp_sockets() {
        let slot = Slot::init(0, Some(Ipv4Addr::LOCALHOST), Duration::from_millis(200)).await.unwrap();
        assert!(!slot.is_bound().await);
        assert_eq!(slot.last_callsign().await, "");
    }

    #[tokio::test]
    async fn accept_rejects_when_already_bound() {
        let slot = Slot::init(1, Some(Ipv4Addr::LOCALHOST), Duration::from_millis(200)).await.unwrap();
        slot.start().await;
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client_a, _accepted_a) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client_a = client_a.unwrap();
        slot.accept(client_a, "KM0H".to_string(), false).await.unwrap();

        let (client_b, _accepted_b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client_b = client_b.unwrap();
        let result = slot.accept(client_b, "N0CALL".to_string(), false).await;
        assert!(matches!(result, Err(ProxyError::Busy)));
    }

    #[tokio::test]
    async fn reconnect_only_requires_matching_callsign() {
        let slot = Slot::init(2, Some(Ipv4Addr::LOCALHOST), Duration::from_millis(200)).await.unwrap();
        slot.start().await;
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client_a, _accepted_a) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client_a = client_a.unwrap();
        slot.accept(client_a, "KM0H".to_string(), false).await.unwrap();
        slot.finish().await;

        let (client_b, _accepted_b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client_b = client_b.unwrap();
        let result = slot.accept(client_b, "N0CALL".to_string(), true).await;
        assert!(matches!(result, Err(ProxyError::Busy)));

        let (client_c, _accepted_c) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client_c = client_c.unwrap();
        slot.accept(client_c, "KM0H".to_string(), true).await.unwrap();
        assert!(slot.is_bound().await);
    }
}
