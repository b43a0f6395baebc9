//! The directory-registration reporter: a single periodically-woken
//! worker that POSTs slot-usage state to the EchoLink directory.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::config::RegistrationConfig;
use crate::digest::{digest, digest_to_hex_lowercase};
use crate::worker::{BodyFuture, Worker};

/// The salt concatenated into the directory-registration digest. Not a
/// secret: it is a fixed constant every EchoLink proxy implementation
/// uses so the directory can verify the `d=` parameter.
const REGISTRATION_SALT: &str = "#5A!zu";

const USER_AGENT: &str = "echolink-proxy/1.2.3o";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrationStatus {
    Unknown = 0,
    Ready = 1,
    Busy = 2,
    Off = 3,
}

impl RegistrationStatus {
    fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::Unknown => "Unknown",
            RegistrationStatus::Ready => "Ready",
            RegistrationStatus::Busy => "Busy",
            RegistrationStatus::Off => "Off",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => RegistrationStatus::Ready,
            2 => RegistrationStatus::Busy,
            3 => RegistrationStatus::Off,
            _ => RegistrationStatus::Unknown,
        }
    }
}

struct ReportedState {
    status: AtomicU8,
    slots_used: std::sync::atomic::AtomicUsize,
    slots_total: std::sync::atomic::AtomicUsize,
}

/// Periodic HTTP reporter. Construction is two-phase like [`crate::slot::Slot`]:
/// `init` builds the shared state, `start` spawns the periodic worker
/// once an `Arc<Self>` exists for the worker body to close over.
pub struct RegistrationReporter {
    config: RegistrationConfig,
    is_public: bool,
    port: u16,
    state: ReportedState,
    worker: tokio::sync::Mutex<Worker<()>>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl RegistrationReporter {
    pub fn init(config: RegistrationConfig, is_public: bool, port: u16) -> Arc<RegistrationReporter> {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Arc::new(RegistrationReporter {
            config,
            is_public,
            port,
            state: ReportedState {
                status: AtomicU8::new(RegistrationStatus::Unknown as u8),
                slots_used: std::sync::atomic::AtomicUsize::new(0),
                slots_total: std::sync::atomic::AtomicUsize::new(0),
            },
            worker: tokio::sync::Mutex::new(Worker::spawn(|_: Option<()>| -> BodyFuture { Box::pin(async {}) }, None)),
            client,
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let reporter = self.clone();
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let worker = Worker::spawn(
            move |_: Option<()>| -> BodyFuture {
                let reporter = reporter.clone();
                Box::pin(async move { reporter.report_once().await })
            },
            Some(interval),
        );
        *self.worker.lock().await = worker;
    }

    /// Explicit `update(used, total)`: overrides the next-report values
    /// and wakes the worker immediately rather than waiting for the
    /// periodic timer.
    pub async fn update(&self, used: usize, total: usize) {
        self.state.slots_used.store(used, Ordering::Relaxed);
        self.state.slots_total.store(total, Ordering::Relaxed);
        if self.state.status.load(Ordering::Relaxed) != RegistrationStatus::Off as u8 {
            let status = if used >= total { RegistrationStatus::Busy } else { RegistrationStatus::Ready };
            self.state.status.store(status as u8, Ordering::Relaxed);
        }
        let _ = self.worker.lock().await.wake(()).await;
    }

    /// Marks the station `Off` and fires one last report, used by
    /// `shutdown()`.
    pub async fn report_shutdown(&self) {
        self.state.status.store(RegistrationStatus::Off as u8, Ordering::Relaxed);
        let _ = self.worker.lock().await.wake(()).await;
        // Give the worker a moment to actually issue the POST before the
        // listener socket (and the process) goes away.
        let _ = self.worker.lock().await.wait_idle().await;
    }

    pub async fn stop(&self) {
        self.worker.lock().await.join().await;
    }

    async fn report_once(&self) {
        let status = RegistrationStatus::from_u8(self.state.status.load(Ordering::Relaxed));
        if status == RegistrationStatus::Unknown {
            debug!("registration: skipping report before first update");
            return;
        }
        let used = self.state.slots_used.load(Ordering::Relaxed);
        let total = self.state.slots_total.load(Ordering::Relaxed);
        let body = self.build_body(status, used, total);

        let uri = format!("http://{}{}", self.config.host, self.config.path);
        let request = match Request::post(&uri)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("User-Agent", USER_AGENT)
            .body(Full::new(Bytes::from(body)))
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "registration: failed to build request");
                return;
            }
        };

        match self.client.request(request).await {
            Ok(response) => {
                if response.status().as_u16() != 200 {
                    warn!(status = %response.status(), "registration: directory rejected report");
                    return;
                }
                debug!(%used, %total, status = status.as_str(), "registration: reported");
                let _ = response.into_body().collect().await;
            }
            Err(e) => {
                warn!(error = %e, "registration: report failed, will retry next period");
            }
        }
    }

    fn build_body(&self, status: RegistrationStatus, used: usize, total: usize) -> String {
        let advertised = self.config.advertised_address.clone().unwrap_or_default();
        let mut input = self.config.name.clone().into_bytes();
        input.extend_from_slice(advertised.as_bytes());
        input.extend_from_slice(REGISTRATION_SALT.as_bytes());
        let suffix = digest_to_hex_lowercase(&digest(&input));

        format!(
            "name={}&comment={} [{used}/{total}]&public={}&status={}&a={}&d={}&p={}&v={}",
            urlencode(&self.config.name),
            urlencode(&self.config.comment),
            if self.is_public { "Y" } else { "N" },
            status.as_str(),
            urlencode(&advertised),
            suffix,
            self.port,
            "1.2.3o",
        )
    }
}

/// Minimal `application/x-www-form-urlencoded` percent-encoding for
/// the handful of free-text fields (`name`, `comment`, advertised
/// address) that go into the POST body.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("Echo Link [1/2]"), "Echo+Link+%5B1%2F2%5D");
        assert_eq!(urlencode("KM0H"), "KM0H");
    }

    #[test]
    fn public_digest_uses_name_address_and_salt() {
        let expected = digest_to_hex_lowercase(&digest(b"MyStationmy.host.example#5A!zu"));
        let input = {
            let mut v = b"MyStation".to_vec();
            v.extend_from_slice(b"my.host.example");
            v.extend_from_slice(REGISTRATION_SALT.as_bytes());
            v
        };
        assert_eq!(digest_to_hex_lowercase(&digest(&input)), expected);
    }
}
