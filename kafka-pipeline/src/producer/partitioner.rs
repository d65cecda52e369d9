use std::sync::atomic::{AtomicUsize, Ordering};

use rdkafka::producer::Partitioner;

/// Spreads records over partitions in turn, ignoring the key. Partitions without a leader are
/// skipped while at least one other partition has one.
#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    next: AtomicUsize,
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(
        &self,
        _topic_name: &str,
        _key: Option<&[u8]>,
        partition_cnt: i32,
        is_partition_available: impl Fn(i32) -> bool,
    ) -> i32 {
        let Ok(count) = usize::try_from(partition_cnt) else {
            return 0;
        };
        if count == 0 {
            return 0;
        }

        let mut fallback = None;
        for _ in 0..count {
            let candidate = self.next_partition(count);
            if is_partition_available(candidate) {
                return candidate;
            }
            fallback.get_or_insert(candidate);
        }
        fallback.unwrap_or(0)
    }
}

impl RoundRobinPartitioner {
    fn next_partition(&self, count: usize) -> i32 {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % count;
        // count came from an i32, so slot fits
        i32::try_from(slot).unwrap_or(0)
    }
}
