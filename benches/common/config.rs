use std::env;

/// Configuration for benchmarks, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Simulated origin latency in milliseconds (from ORIGIN_LATENCY_MS env var, defaults to 5)
    pub origin_latency_ms: u64,

    /// Largest subscriber fan-out measured (from BENCH_SUBSCRIBERS env var, defaults to 1000)
    pub max_subscribers: usize,

    /// Sample size for benchmarks (from BENCH_SAMPLE_SIZE env var, defaults to 100)
    pub sample_size: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            origin_latency_ms: env::var("ORIGIN_LATENCY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            max_subscribers: env::var("BENCH_SUBSCRIBERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            sample_size: env::var("BENCH_SAMPLE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
        }
    }
}

impl BenchConfig {
    pub fn new() -> Self {
        let config = Self::default();
        eprintln!("Benchmark Configuration:");
        eprintln!("  Origin Latency: {}ms", config.origin_latency_ms);
        eprintln!("  Max Subscribers: {}", config.max_subscribers);
        eprintln!("  Sample Size: {}", config.sample_size);
        config
    }

    /// Fan-out sizes to measure, capped by `max_subscribers`.
    pub fn fan_outs(&self) -> Vec<usize> {
        [1, 10, 100, 1000]
            .into_iter()
            .filter(|n| *n <= self.max_subscribers)
            .collect()
    }
}
