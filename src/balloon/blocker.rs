//! Reference balloon blocker.

use super::{BalloonBlocker, BalloonWorker, ResizeDirection, ResizeRequest};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vmmem_protocol::ResizePriority;

/// How long a resize blocks the opposite direction.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(5);

/// Low-level balloon control.
pub trait Balloon: Send + Sync {
    /// Set the balloon size in bytes. May block on the guest.
    fn set_target(&self, bytes: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Block {
    /// Resizes at or below this priority are refused.
    priority: ResizePriority,
    until: Instant,
}

/// What the worker last managed to apply.
#[derive(Debug, Default)]
struct Applied {
    bytes: u64,
    failed: bool,
}

/// Blocker that tracks the balloon target and refuses to undo recent work.
///
/// A resize at priority `p` blocks the opposite direction at priorities up
/// to and including `p` for the block duration, so a guest that just got
/// memory back under kill pressure is not re-inflated by less urgent work.
pub struct TimedBalloonBlocker {
    cid: u32,
    balloon: Arc<dyn Balloon>,
    worker: BalloonWorker,
    target_bytes: u64,
    max_bytes: u64,
    block_duration: Duration,
    blocks: HashMap<ResizeDirection, Block>,
    applied: Arc<Mutex<Applied>>,
}

impl TimedBalloonBlocker {
    /// Create a blocker for an empty balloon that may grow to `max_bytes`.
    pub fn new(
        cid: u32,
        balloon: Arc<dyn Balloon>,
        worker: BalloonWorker,
        max_bytes: u64,
        block_duration: Duration,
    ) -> Self {
        Self {
            cid,
            balloon,
            worker,
            target_bytes: 0,
            max_bytes,
            block_duration,
            blocks: HashMap::new(),
            applied: Arc::default(),
        }
    }

    /// Current balloon target as tracked by the blocker.
    pub fn target_bytes(&self) -> u64 {
        self.target_bytes
    }

    fn resync(&mut self) {
        let mut applied = self.applied.lock();
        if applied.failed {
            debug!(cid = self.cid, bytes = applied.bytes, "resyncing balloon target");
            self.target_bytes = applied.bytes;
            applied.failed = false;
        }
    }

    fn apply(&self, target: u64) {
        let balloon = self.balloon.clone();
        let applied = self.applied.clone();
        let cid = self.cid;

        self.worker.post(move || match balloon.set_target(target) {
            Ok(()) => {
                let mut applied = applied.lock();
                applied.bytes = target;
                applied.failed = false;
            }
            Err(e) => {
                warn!(cid, target, error = %e, "failed to resize balloon");
                applied.lock().failed = true;
            }
        });
    }

    fn block(&mut self, direction: ResizeDirection, priority: ResizePriority, now: Instant) {
        let block = Block {
            priority,
            until: now + self.block_duration,
        };

        match self.blocks.get(&direction) {
            Some(existing) if existing.until > now && existing.priority > priority => {}
            _ => {
                self.blocks.insert(direction, block);
            }
        }
    }
}

impl BalloonBlocker for TimedBalloonBlocker {
    fn try_resize(&mut self, request: ResizeRequest) -> i64 {
        let now = Instant::now();
        let direction = request.direction();

        if request.priority < self.lowest_unblocked_priority(direction, now) {
            debug!(cid = self.cid, ?direction, priority = %request.priority, "resize blocked");
            return 0;
        }

        self.resync();

        let current = self.target_bytes as i128;
        let wanted = (current + request.delta_bytes as i128).clamp(0, self.max_bytes as i128);
        let delta = (wanted - current) as i64;
        if delta == 0 {
            return 0;
        }

        self.target_bytes = wanted as u64;
        self.apply(self.target_bytes);
        self.block(direction.opposite(), request.priority, now);

        delta
    }

    fn lowest_unblocked_priority(
        &self,
        direction: ResizeDirection,
        now: Instant,
    ) -> ResizePriority {
        match self.blocks.get(&direction) {
            Some(block) if block.until > now => block.priority.next(),
            _ => ResizePriority::Lowest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Reports every target it is given.
    struct RecordingBalloon {
        tx: parking_lot::Mutex<mpsc::Sender<u64>>,
        fail: bool,
    }

    impl Balloon for RecordingBalloon {
        fn set_target(&self, bytes: u64) -> Result<()> {
            let _ = self.tx.lock().send(bytes);
            if self.fail {
                return Err(crate::error::Error::balloon_command("test", "refused"));
            }
            Ok(())
        }
    }

    fn blocker(max_bytes: u64, fail: bool) -> (TimedBalloonBlocker, mpsc::Receiver<u64>) {
        let (tx, rx) = mpsc::channel();
        let balloon = Arc::new(RecordingBalloon {
            tx: parking_lot::Mutex::new(tx),
            fail,
        });
        let worker = BalloonWorker::spawn().unwrap();
        (
            TimedBalloonBlocker::new(7, balloon, worker, max_bytes, DEFAULT_BLOCK_DURATION),
            rx,
        )
    }

    fn recv(rx: &mpsc::Receiver<u64>) -> u64 {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_resize_applies_target_on_worker() {
        let (mut blocker, rx) = blocker(1000, false);

        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::MglruReclaim, 300)),
            300
        );
        assert_eq!(recv(&rx), 300);
        assert_eq!(blocker.target_bytes(), 300);
    }

    #[test]
    fn test_resize_is_clamped() {
        let (mut blocker, _rx) = blocker(1000, false);

        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, 1500)),
            1000
        );
        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, -2000)),
            -1000
        );
        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, -5)),
            0
        );
    }

    #[test]
    fn test_deflate_blocks_lower_priority_inflate() {
        let (mut blocker, _rx) = blocker(1000, false);
        blocker.try_resize(ResizeRequest::new(ResizePriority::MglruReclaim, 500));
        blocker.try_resize(ResizeRequest::new(ResizePriority::CachedApp, -100));

        let now = Instant::now();
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now),
            ResizePriority::PerceptibleTab
        );
        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::MglruReclaim, 100)),
            0
        );
        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::FocusedApp, 100)),
            100
        );
        assert_eq!(
            blocker.lowest_unblocked_priority(
                ResizeDirection::Inflate,
                now + DEFAULT_BLOCK_DURATION * 2
            ),
            ResizePriority::Lowest
        );
    }

    #[test]
    fn test_failed_apply_resyncs_target() {
        let (mut blocker, rx) = blocker(1000, true);

        blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, 400));
        assert_eq!(recv(&rx), 400);
        // Give the worker time to record the failure after set_target returns.
        std::thread::sleep(Duration::from_millis(50));

        // The failed 400 is forgotten before applying the next resize.
        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, 100)),
            100
        );
        assert_eq!(blocker.target_bytes(), 100);
    }
}
