//! MGLRU-driven proactive reclaim.
//!
//! Every context keeps generations ordered by birth time. When any context
//! ages a new generation, the broker picks the age of the youngest "oldest
//! generation" across all contexts as a threshold and asks each context to
//! give up the file-backed memory older than it. Generations straddling the
//! threshold contribute a linear share of their size.

use super::StatsSource;
use crate::mglru;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};
use vmmem_protocol::{cid, MglruStats, Node, ResizePriority};

/// Bytes to reclaim per context. Only nonzero entries are present.
pub type ReclaimOperation = BTreeMap<u32, u64>;

/// Host stats reader.
pub type LocalStats = Box<dyn FnMut() -> Option<MglruStats> + Send>;

/// Millisecond clock, in the same time base as generation timestamps.
pub type Clock = Box<dyn Fn() -> u64 + Send>;

/// Tunables for the reclaim broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimSettings {
    /// Minimum time between emitted reclaim passes.
    pub min_interval: Duration,
    /// Passes reclaiming less than this in total are discarded.
    pub min_reclaim_bytes: u64,
}

impl Default for ReclaimSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(30),
            min_reclaim_bytes: 1024 * 1024,
        }
    }
}

/// Milliseconds since boot, including suspend.
pub fn boot_time_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    if ret != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Computes reclaim operations from per-context MGLRU stats.
pub struct ReclaimBroker {
    guests: BTreeSet<u32>,
    local_stats: LocalStats,
    clock: Clock,
    last_reclaim_ms: Option<u64>,
    settings: ReclaimSettings,
}

impl ReclaimBroker {
    /// Create a broker that reads host stats with `local_stats`.
    pub fn new(local_stats: LocalStats, clock: Clock, settings: ReclaimSettings) -> Self {
        Self {
            guests: BTreeSet::new(),
            local_stats,
            clock,
            last_reclaim_ms: None,
            settings,
        }
    }

    /// Include VM `cid` in reclaim passes.
    pub fn register_vm(&mut self, cid: u32) {
        if cid != cid::LOCAL {
            self.guests.insert(cid);
        }
    }

    /// Stop including VM `cid`.
    pub fn remove_vm(&mut self, cid: u32) {
        self.guests.remove(&cid);
    }

    /// React to context `cid` aging a new generation.
    ///
    /// `stats` are the stats pushed with the notification, if any; every other
    /// context is queried through `local_stats` or `source`. Contexts without
    /// stats, or with a tree over the size caps, are left out of the pass.
    /// Returns the pass to apply, or `None` when reclaim is blocked, too soon,
    /// or too small.
    pub fn handle_new_generation(
        &mut self,
        cid: u32,
        stats: Option<MglruStats>,
        lowest_unblocked: ResizePriority,
        source: &mut dyn StatsSource,
    ) -> Option<ReclaimOperation> {
        if lowest_unblocked > ResizePriority::MglruReclaim {
            debug!(%lowest_unblocked, "reclaim blocked");
            return None;
        }

        let now = (self.clock)();
        if let Some(last) = self.last_reclaim_ms {
            if now.saturating_sub(last) < self.settings.min_interval.as_millis() as u64 {
                return None;
            }
        }

        let mut pushed = stats;
        let contexts: Vec<u32> = std::iter::once(cid::LOCAL)
            .chain(self.guests.iter().copied())
            .collect();

        let mut collected = Vec::with_capacity(contexts.len());
        for context in contexts {
            let stats = if context == cid && pushed.is_some() {
                pushed.take()
            } else if context == cid::LOCAL {
                (self.local_stats)()
            } else {
                source.get_stats(context)
            };

            match stats {
                Some(stats) if !mglru::within_limits(&stats) => {
                    warn!(cid = context, "mglru stats exceed limits, excluding context");
                }
                Some(stats) if oldest_age(&stats, now).is_some() => collected.push((context, stats)),
                Some(_) => debug!(cid = context, "excluding context without generations"),
                None => debug!(cid = context, "excluding context without stats"),
            }
        }

        let threshold = collected
            .iter()
            .filter_map(|(_, stats)| oldest_age(stats, now))
            .min()?;

        let operation: ReclaimOperation = collected
            .iter()
            .map(|(context, stats)| {
                let bytes = reclaim_kb(stats, now, threshold).saturating_mul(1024);
                (*context, bytes)
            })
            .filter(|(_, bytes)| *bytes > 0)
            .collect();

        let total = operation
            .values()
            .fold(0u64, |total, bytes| total.saturating_add(*bytes));
        if operation.is_empty() || total < self.settings.min_reclaim_bytes {
            debug!(total, threshold, "reclaim too small");
            return None;
        }

        info!(total, threshold_ms = threshold, contexts = operation.len(), "mglru reclaim");
        self.last_reclaim_ms = Some(now);
        Some(operation)
    }
}

fn age(timestamp_ms: u64, now: u64) -> u64 {
    now.saturating_sub(timestamp_ms)
}

/// Age of the oldest generation in `stats`.
fn oldest_age(stats: &MglruStats, now: u64) -> Option<u64> {
    mglru::generations(stats)
        .map(|generation| age(generation.timestamp_ms, now))
        .max()
}

fn reclaim_kb(stats: &MglruStats, now: u64, threshold: u64) -> u64 {
    stats
        .cgs
        .iter()
        .flat_map(|memcg| memcg.nodes.iter())
        .map(|node| node_reclaim_kb(node, now, threshold))
        .fold(0, u64::saturating_add)
}

fn node_reclaim_kb(node: &Node, now: u64, threshold: u64) -> u64 {
    let mut ages: Vec<(u64, u64)> = node
        .generations
        .iter()
        .map(|generation| (age(generation.timestamp_ms, now), generation.file_kb))
        .collect();
    ages.sort_by(|a, b| b.0.cmp(&a.0));

    let mut total: u64 = 0;
    for (i, (generation_age, file_kb)) in ages.iter().copied().enumerate() {
        if generation_age <= threshold {
            break;
        }

        let newer_age = ages.get(i + 1).map(|(age, _)| *age).unwrap_or(0);
        if newer_age >= threshold {
            total = total.saturating_add(file_kb);
        } else {
            // share <= file_kb, so it fits back into u64
            let share = u128::from(file_kb) * u128::from(generation_age - threshold)
                / u128::from(generation_age - newer_age);
            total = total.saturating_add(share as u64);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use vmmem_protocol::{Generation, Memcg};

    #[derive(Default)]
    struct FakeSource {
        stats: HashMap<u32, MglruStats>,
        queried: Vec<u32>,
    }

    impl StatsSource for FakeSource {
        fn get_stats(&mut self, cid: u32) -> Option<MglruStats> {
            self.queried.push(cid);
            self.stats.get(&cid).cloned()
        }
    }

    /// Stats with one node holding `(timestamp_ms, file_kb)` generations.
    fn stats(generations: &[(u64, u64)]) -> MglruStats {
        MglruStats {
            cgs: vec![Memcg {
                id: 0,
                nodes: vec![Node {
                    id: 0,
                    generations: generations
                        .iter()
                        .enumerate()
                        .map(|(i, (timestamp_ms, file_kb))| Generation {
                            sequence_num: i as u64,
                            timestamp_ms: *timestamp_ms,
                            anon_kb: 0,
                            file_kb: *file_kb,
                        })
                        .collect(),
                }],
            }],
        }
    }

    struct Harness {
        broker: ReclaimBroker,
        source: FakeSource,
        now: Arc<AtomicU64>,
        local: Arc<Mutex<Option<MglruStats>>>,
    }

    impl Harness {
        fn new(settings: ReclaimSettings) -> Self {
            let now = Arc::new(AtomicU64::new(1000));
            let local: Arc<Mutex<Option<MglruStats>>> = Arc::default();

            let clock_now = now.clone();
            let local_stats = local.clone();
            let broker = ReclaimBroker::new(
                Box::new(move || local_stats.lock().clone()),
                Box::new(move || clock_now.load(Ordering::SeqCst)),
                settings,
            );

            Self {
                broker,
                source: FakeSource::default(),
                now,
                local,
            }
        }

        fn unthrottled() -> Self {
            Self::new(ReclaimSettings {
                min_interval: Duration::from_secs(30),
                min_reclaim_bytes: 0,
            })
        }

        fn notify(&mut self, cid: u32, stats: Option<MglruStats>) -> Option<ReclaimOperation> {
            self.broker.handle_new_generation(
                cid,
                stats,
                ResizePriority::Lowest,
                &mut self.source,
            )
        }

        fn advance(&self, ms: u64) {
            self.now.fetch_add(ms, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_partial_generation_is_interpolated() {
        let mut h = Harness::unthrottled();
        h.broker.register_vm(5);
        // now = 1000: host oldest age 13, guest single generation age 20.
        *h.local.lock() = Some(stats(&[(987, 100)]));

        let operation = h.notify(5, Some(stats(&[(980, 10)]))).unwrap();

        // 10 * (20 - 13) / (20 - 0) = 3 KB
        assert_eq!(operation, ReclaimOperation::from([(5, 3 * 1024)]));
        assert!(h.source.queried.is_empty());
    }

    #[test]
    fn test_generations_older_than_threshold_are_reclaimed_in_full() {
        let mut h = Harness::unthrottled();
        h.broker.register_vm(5);
        *h.local.lock() = Some(stats(&[(900, 7)]));
        // Ages 400, 200 and 50 against a threshold of 100.
        h.source
            .stats
            .insert(5, stats(&[(600, 1000), (800, 300), (950, 150)]));

        let operation = h.notify(cid::LOCAL, None).unwrap();

        // 1000 in full, then 300 * (200 - 100) / (200 - 50) = 200.
        assert_eq!(operation, ReclaimOperation::from([(5, 1200 * 1024)]));
        assert_eq!(h.source.queried, vec![5]);
    }

    #[test]
    fn test_passes_are_rate_limited() {
        let mut h = Harness::unthrottled();
        h.broker.register_vm(5);
        *h.local.lock() = Some(stats(&[(990, 100)]));
        let guest = stats(&[(900, 1_000_000)]);

        assert!(h.notify(5, Some(guest.clone())).is_some());
        h.advance(29_999);
        assert!(h.notify(5, Some(guest.clone())).is_none());
        h.advance(1);
        assert!(h.notify(5, Some(guest)).is_some());
    }

    #[test]
    fn test_small_pass_is_discarded_without_resetting_interval() {
        let mut h = Harness::new(ReclaimSettings::default());
        h.broker.register_vm(5);
        *h.local.lock() = Some(stats(&[(990, 100)]));

        // 10 KB is under the 1 MiB threshold.
        assert!(h.notify(5, Some(stats(&[(900, 10)]))).is_none());

        h.advance(1);
        let operation = h.notify(5, Some(stats(&[(900, 4096)]))).unwrap();
        assert!(operation[&5] >= 1024 * 1024);
    }

    #[test]
    fn test_blocked_reclaim_is_skipped() {
        let mut h = Harness::unthrottled();
        h.broker.register_vm(5);
        *h.local.lock() = Some(stats(&[(990, 100)]));

        let operation = h.broker.handle_new_generation(
            5,
            Some(stats(&[(900, 100)])),
            ResizePriority::NoKillCandidatesGuest,
            &mut h.source,
        );
        assert!(operation.is_none());

        // Reclaim itself may still run.
        let operation = h.broker.handle_new_generation(
            5,
            Some(stats(&[(900, 100)])),
            ResizePriority::MglruReclaim,
            &mut h.source,
        );
        assert!(operation.is_some());
    }

    #[test]
    fn test_contexts_without_stats_are_excluded() {
        let mut h = Harness::unthrottled();
        h.broker.register_vm(5);
        h.broker.register_vm(6);
        // Host and guest 6 have nothing; guest 5 alone sets the threshold.
        let operation = h.notify(5, Some(stats(&[(900, 100), (950, 100)])));

        assert!(operation.is_none());
        assert_eq!(h.source.queried, vec![6]);
    }

    #[test]
    fn test_oversized_stats_exclude_only_that_context() {
        let mut h = Harness::unthrottled();
        h.broker.register_vm(5);
        h.broker.register_vm(6);
        *h.local.lock() = Some(stats(&[(500, 100), (900, 1)]));
        h.source.stats.insert(6, stats(&[(990, 100)]));

        let mut oversized = stats(&[(100, 100)]);
        oversized.cgs = vec![oversized.cgs[0].clone(); mglru::MAX_MEMCGS + 1];
        h.source.stats.insert(5, oversized);

        // Guest 6 sets the threshold at 10ms.
        let operation = h.notify(cid::LOCAL, None).unwrap();
        assert_eq!(operation, ReclaimOperation::from([(cid::LOCAL, 100 * 1024)]));
        assert_eq!(h.source.queried, vec![5, 6]);
    }

    #[test]
    fn test_oversized_pushed_stats_exclude_the_pusher() {
        let mut h = Harness::unthrottled();
        h.broker.register_vm(5);
        h.broker.register_vm(6);
        *h.local.lock() = Some(stats(&[(500, 100), (900, 1)]));
        h.source.stats.insert(6, stats(&[(990, 100)]));

        let mut oversized = stats(&[(100, 100)]);
        let generation = oversized.cgs[0].nodes[0].generations[0];
        oversized.cgs[0].nodes[0].generations = vec![generation; mglru::MAX_GENERATIONS + 1];

        let operation = h.notify(5, Some(oversized)).unwrap();
        assert_eq!(operation, ReclaimOperation::from([(cid::LOCAL, 100 * 1024)]));
        assert_eq!(h.source.queried, vec![6]);
    }

    #[test]
    fn test_huge_guest_sizes_saturate() {
        let mut h = Harness::unthrottled();
        h.broker.register_vm(5);
        *h.local.lock() = Some(stats(&[(900, 100)]));

        // Ages 1000, 900 and 800 against a threshold of 100.
        let huge = u64::MAX / 2;
        let guest = stats(&[(0, huge), (100, huge), (200, huge)]);

        let operation = h.notify(5, Some(guest)).unwrap();
        assert_eq!(operation, ReclaimOperation::from([(5, u64::MAX)]));
    }

    #[test]
    fn test_node_reclaim_saturates_across_generations() {
        let node = Node {
            id: 0,
            generations: (0..3)
                .map(|i| Generation {
                    sequence_num: i,
                    timestamp_ms: i * 10,
                    anon_kb: 0,
                    file_kb: u64::MAX,
                })
                .collect(),
        };
        assert_eq!(node_reclaim_kb(&node, 1000, 0), u64::MAX);
    }

    #[test]
    fn test_removed_vm_is_not_queried() {
        let mut h = Harness::unthrottled();
        h.broker.register_vm(5);
        h.broker.remove_vm(5);
        *h.local.lock() = Some(stats(&[(900, 100)]));

        assert!(h.notify(cid::LOCAL, None).is_none());
        assert!(h.source.queried.is_empty());
    }

    #[test]
    fn test_future_timestamps_count_as_age_zero() {
        let node = Node {
            id: 0,
            generations: vec![Generation {
                sequence_num: 0,
                timestamp_ms: 5000,
                anon_kb: 0,
                file_kb: 100,
            }],
        };
        assert_eq!(node_reclaim_kb(&node, 1000, 0), 0);
    }
}
