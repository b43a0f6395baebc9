//! The shared, immutable-after-`open()` context every task needs a
//! handle to: configuration, the slot pool, the compiled callsign
//! filter, and the registration reporter.
//!
//! Rather than a back-reference cycle between a connection and its
//! owning handle, every task holds its own `Arc<ProxyContext>`
//! alongside (not back-pointing into) its own slot/worker state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::callsign_filter::CallsignFilter;
use crate::config::ProxyConfig;
use crate::registration::RegistrationReporter;
use crate::slot_pool::SlotPool;

pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    pub slots: Arc<SlotPool>,
    pub callsign_filter: Arc<CallsignFilter>,
    pub registration: Arc<RegistrationReporter>,
    /// `true` while the listener should keep accepting, flipped to
    /// `false` by `shutdown()`. A plain `bool` suffices because the
    /// only states that matter are "accepting" and "draining";
    /// slot/worker counts already live in `SlotPool`/`ClientWorkerPool`.
    accepting: AtomicBool,
}

impl ProxyContext {
    pub fn new(
        config: Arc<ProxyConfig>,
        slots: Arc<SlotPool>,
        callsign_filter: Arc<CallsignFilter>,
        registration: Arc<RegistrationReporter>,
    ) -> Arc<ProxyContext> {
        Arc::new(ProxyContext { config, slots, callsign_filter, registration, accepting: AtomicBool::new(true) })
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }
}
