//! vmmem - host/guest memory balancing over virtio balloons.
//!
//! Killers on the host and in guests ask the service how much memory it can
//! free before they kill a process, and kernels report multi-generational
//! LRU aging so cold memory can be reclaimed proactively. Both signals end up
//! as resizes of per-VM balloons.

pub mod balloon;
pub mod broker;
pub mod config;
pub mod error;
pub mod mglru;
pub mod server;
pub mod service;
pub mod timer;
pub mod transport;

pub use error::{Error, Result};
pub use vmmem_protocol as protocol;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
