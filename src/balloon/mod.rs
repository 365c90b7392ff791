//! Balloon resizing.
//!
//! The brokers only talk to balloons through [`BalloonBlocker`]: a signed
//! resize that may be partially refused, plus a query for the priority floor
//! currently enforced in each direction. Blockers are built by a
//! [`BlockerFactory`] and hand their slow work to a dedicated
//! [`BalloonWorker`] so the decision sequence never waits on a guest.

mod blocker;
mod crosvm;

pub use blocker::{Balloon, TimedBalloonBlocker, DEFAULT_BLOCK_DURATION};
pub use crosvm::CrosvmBalloon;

use crate::error::Result;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vmmem_protocol::ResizePriority;

/// Direction a balloon moves in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResizeDirection {
    /// Grow the balloon, taking memory from the guest.
    Inflate,
    /// Shrink the balloon, giving memory back to the guest.
    Deflate,
}

impl ResizeDirection {
    /// Both directions.
    pub const ALL: [ResizeDirection; 2] = [ResizeDirection::Inflate, ResizeDirection::Deflate];

    /// The other direction.
    pub fn opposite(self) -> Self {
        match self {
            ResizeDirection::Inflate => ResizeDirection::Deflate,
            ResizeDirection::Deflate => ResizeDirection::Inflate,
        }
    }
}

/// A signed balloon resize at some priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeRequest {
    /// Urgency of the resize.
    pub priority: ResizePriority,
    /// Positive inflates, negative deflates.
    pub delta_bytes: i64,
}

impl ResizeRequest {
    /// Create a resize request.
    pub fn new(priority: ResizePriority, delta_bytes: i64) -> Self {
        Self {
            priority,
            delta_bytes,
        }
    }

    /// Direction of the resize. Zero counts as inflate.
    pub fn direction(&self) -> ResizeDirection {
        if self.delta_bytes < 0 {
            ResizeDirection::Deflate
        } else {
            ResizeDirection::Inflate
        }
    }
}

/// Per-VM balloon wrapper that may refuse motion.
pub trait BalloonBlocker: Send {
    /// Attempt a resize and return the signed delta actually applied.
    ///
    /// The result never exceeds the request in magnitude and never has the
    /// opposite sign; a smaller magnitude means the motion was refused.
    fn try_resize(&mut self, request: ResizeRequest) -> i64;

    /// Least urgent priority at which a resize in `direction` is currently
    /// allowed.
    fn lowest_unblocked_priority(&self, direction: ResizeDirection, now: Instant)
        -> ResizePriority;
}

/// Builds a blocker for `(cid, balloon target, worker)`.
pub type BlockerFactory =
    Box<dyn FnMut(u32, &str, BalloonWorker) -> Box<dyn BalloonBlocker> + Send>;

type Job = Box<dyn FnOnce() + Send>;

/// Handle to the dedicated balloon thread.
///
/// Jobs run one at a time in posting order. The thread exits once every
/// handle is dropped.
#[derive(Clone)]
pub struct BalloonWorker {
    tx: mpsc::UnboundedSender<Job>,
}

impl BalloonWorker {
    /// Spawn the worker thread.
    pub fn spawn() -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name("vmmem-balloon".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
                debug!("balloon worker exiting");
            })?;

        Ok(Self { tx })
    }

    /// Queue a job. Returns false if the worker is gone.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("balloon worker is gone, dropping job");
            return false;
        }
        true
    }
}
