use async_trait::async_trait;
use cached_value::{BoxError, Producer};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Test data structure for benchmarks
#[derive(Clone, Debug, PartialEq)]
pub struct BenchProfile {
    pub id: u64,
    pub name: String,
    pub followers: u32,
}

impl BenchProfile {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("User {}", id),
            followers: (id % 1000) as u32,
        }
    }
}

/// Simulated origin with configurable latency. Each fetch yields the next profile.
#[derive(Clone)]
pub struct FakeOrigin {
    latency_ms: u64,
    next_id: Arc<AtomicU64>,
    query_count: Arc<AtomicUsize>,
}

impl FakeOrigin {
    pub fn new(latency_ms: u64) -> Self {
        Self {
            latency_ms,
            next_id: Arc::new(AtomicU64::new(0)),
            query_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[allow(dead_code)]
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Producer<BenchProfile> for FakeOrigin {
    async fn produce(&self) -> Result<BenchProfile, BoxError> {
        self.query_count.fetch_add(1, Ordering::Relaxed);

        // Simulate origin latency
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }

        Ok(BenchProfile::new(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }
}

/// A single step of a mixed workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Subscribe,
    Transform,
    Refresh,
}

/// Generate operation sequences for different workload patterns
pub struct WorkloadGenerator {
    len: usize,
}

impl WorkloadGenerator {
    pub fn new(len: usize) -> Self {
        Self { len }
    }

    /// Mostly reads: `read_ratio` of the operations subscribe, the rest are
    /// split between optimistic edits and refreshes.
    pub fn mixed(&self, read_ratio: f64) -> Vec<Op> {
        let mut rng = rand::thread_rng();
        (0..self.len)
            .map(|_| {
                if rng.gen_bool(read_ratio) {
                    Op::Subscribe
                } else if rng.gen_bool(0.5) {
                    Op::Transform
                } else {
                    Op::Refresh
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn test_fake_origin() {
        use super::FakeOrigin;
        use cached_value::Producer;

        let origin = FakeOrigin::new(1);

        let first = origin.produce().await.unwrap();
        let second = origin.produce().await.unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);

        assert_eq!(origin.query_count(), 2);
    }

    #[test]
    fn test_workload_generator() {
        use super::{Op, WorkloadGenerator};

        let ops = WorkloadGenerator::new(100).mixed(1.0);
        assert_eq!(ops.len(), 100);
        assert!(ops.iter().all(|op| *op == Op::Subscribe));
    }
}
