#![forbid(unsafe_code)]

//! Core of an EchoLink proxy server: a multi-slot TCP/UDP relay that
//! authenticates client connections and forwards their TCP and UDP
//! flows to arbitrary EchoLink hosts over a small binary framing
//! protocol, while periodically advertising slot usage to the
//! EchoLink directory service.

pub mod callsign_filter;
pub mod client;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod frame;
pub mod listener;
pub mod nonce;
pub mod orchestrator;
pub mod registration;
pub mod slot;
pub mod slot_pool;
pub mod worker;

pub use config::{load_from_path, load_from_str, ProxyConfig};
pub use context::ProxyContext;
pub use error::{ProxyError, Result};
pub use orchestrator::{Proxy, ProxyState};
