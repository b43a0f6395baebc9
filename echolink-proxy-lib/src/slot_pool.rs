//! The slot pool and admission scheduler: an ordered list of slots
//! plus an idle list ordered oldest-idle-first, searched for a
//! reconnect match before falling back to the least-recently-used
//! slot.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::slot::Slot;

/// Owns every slot for the server's lifetime and the idle-list
/// bookkeeping used by [`SlotPool::admit`].
///
/// The idle list is a `VecDeque<usize>` of slot indices: O(1)
/// push-to-tail, and since the pool is always small (one entry per
/// external address), an O(n) scan-and-remove for the reconnect-match
/// case costs nothing in practice.
pub struct SlotPool {
    slots: Vec<Arc<Slot>>,
    idle: Mutex<VecDeque<usize>>,
}

impl SlotPool {
    /// Builds one slot per configured external address (primary
    /// first), binds their outbound sockets, and starts their
    /// forwarders. All slots begin idle, in configuration order:
    /// the initial LRU ordering before any client has ever connected.
    pub async fn init(config: &ProxyConfig, connect_timeout: Duration) -> Result<SlotPool> {
        let addresses: Vec<Option<Ipv4Addr>> = config.external_addresses();
        let mut slots = Vec::with_capacity(addresses.len());
        for (index, addr) in addresses.into_iter().enumerate() {
            let slot = Slot::init(index, addr, connect_timeout).await?;
            slot.start().await;
            slots.push(slot);
        }
        let idle = (0..slots.len()).collect();
        Ok(SlotPool { slots, idle: Mutex::new(idle) })
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub async fn used(&self) -> usize {
        self.total() - self.idle.lock().await.len()
    }

    /// A single pass over the idle list, head to tail, looking for a
    /// slot whose `last_callsign` matches; if none matches, the head
    /// (longest-idle) slot is used instead. Ties on "no reconnect
    /// match" resolve to the head.
    ///
    /// Holds the idle-list lock for the whole decision plus the
    /// `accept()` call: no other slot-level lock is taken while `idle`
    /// is held, and `accept` itself only touches the winning slot.
    pub async fn admit(&self, client: TcpStream, callsign: &str) -> Result<(Arc<Slot>, OwnedReadHalf)> {
        let mut idle = self.idle.lock().await;
        if idle.is_empty() {
            return Err(ProxyError::NoSlot);
        }

        let mut reconnect_pos = None;
        for (pos, &slot_idx) in idle.iter().enumerate() {
            if self.slots[slot_idx].last_callsign().await == callsign {
                reconnect_pos = Some(pos);
                break;
            }
        }

        let (pos, reconnect) = match reconnect_pos {
            Some(pos) => (pos, true),
            None => (0, false),
        };
        let slot_idx = idle.remove(pos).expect("pos came from a valid index into idle");
        let slot = self.slots[slot_idx].clone();
        drop(idle);

        match slot.accept(client, callsign.to_string(), reconnect).await {
            Ok(read_half) => Ok((slot, read_half)),
            Err(e) => {
                // Should not happen: the pool lock serializes admission
                // and the chosen slot was just removed from idle. If it
                // does (e.g. a stale binding), return the slot to idle
                // so it isn't leaked from the pool.
                self.idle.lock().await.push_back(slot_idx);
                Err(e)
            }
        }
    }

    /// Returns a slot to the pool, appended at the idle list's tail
    /// (longest-idle-first ordering). Called after a slot's serving
    /// loop ends and `finish()` has completed.
    pub async fn release(&self, slot: &Arc<Slot>) {
        self.idle.lock().await.push_back(slot.index);
    }

    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    /// Force-disconnects every currently-bound client. Used by
    /// `close()` so a client worker blocked in `slot.process()` on a
    /// still-open connection is unblocked before teardown waits for
    /// its task to finish; a client that already disconnected on its
    /// own leaves nothing to drop.
    pub async fn drop_all_clients(&self) {
        for slot in &self.slots {
            if slot.is_bound().await {
                slot.drop_client().await;
            }
        }
    }

    /// Stops every slot's forwarders. Used at server teardown.
    pub async fn stop_all(&self) {
        for slot in &self.slots {
            slot.stop().await;
        }
    }
}
