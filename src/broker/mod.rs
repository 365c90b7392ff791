//! Memory brokers.
//!
//! - [`BalloonBroker`]: per-context state, kill decisions and even
//!   distribution of resizes across connected VMs.
//! - [`ReclaimBroker`]: proactive reclaim computed from MGLRU aging.

mod balloon;
mod reclaim;

pub use balloon::{BalloonBroker, BrokerSettings};
pub use reclaim::{
    boot_time_ms, Clock, LocalStats, ReclaimBroker, ReclaimOperation, ReclaimSettings,
};

use vmmem_protocol::MglruStats;

/// Source of current MGLRU stats for guest contexts.
pub trait StatsSource {
    /// Fetch stats for `cid`, or `None` if they cannot be obtained.
    fn get_stats(&mut self, cid: u32) -> Option<MglruStats>;
}
