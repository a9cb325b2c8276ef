//! Per-component latency and failure tracking.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use mnemos_common::Result;
use parking_lot::RwLock;
use serde::Serialize;

use crate::circuit_breaker::CircuitBreaker;

/// Component names used by the pipeline.
pub mod components {
    pub const DETECTOR: &str = "detector";
    pub const EMBEDDING: &str = "embedding";
    pub const RETRIEVAL: &str = "retrieval";
    /// One sample per finished task; feeds the circuit breaker
    pub const BACKGROUND_TASK: &str = "background_task";
    /// One sample per execution attempt, retries included
    pub const TASK_ATTEMPT: &str = "task_attempt";
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    duration_ms: f64,
    success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStats {
    pub component: String,
    pub count: usize,
    pub failures: usize,
    pub failure_rate: f64,
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

pub struct PerformanceMonitor {
    max_samples: usize,
    samples: RwLock<HashMap<String, VecDeque<Sample>>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl PerformanceMonitor {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples: max_samples.max(1),
            samples: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Samples recorded for `component` from now on also count toward the
    /// breaker's consecutive-failure counter.
    pub fn attach_breaker(&self, component: &str, breaker: Arc<CircuitBreaker>) {
        self.breakers.write().insert(component.to_string(), breaker);
    }

    pub fn record_sample(&self, component: &str, duration_ms: f64, success: bool) {
        {
            let mut samples = self.samples.write();
            let ring = samples.entry(component.to_string()).or_default();
            if ring.len() == self.max_samples {
                ring.pop_front();
            }
            ring.push_back(Sample {
                duration_ms,
                success,
            });
        }

        if let Some(breaker) = self.breakers.read().get(component) {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    /// Runs `fut`, recording its latency and whether it returned `Ok`.
    pub async fn observe<T, F>(&self, component: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        self.record_sample(component, elapsed_ms(start), result.is_ok());
        result
    }

    /// Fraction of failures among the last `window_size` samples; 0.0 with
    /// no samples.
    pub fn current_failure_rate(&self, component: &str, window_size: usize) -> f64 {
        let samples = self.samples.read();
        let Some(ring) = samples.get(component) else {
            return 0.0;
        };
        let window = window_size.min(ring.len());
        if window == 0 {
            return 0.0;
        }
        let failures = ring.iter().rev().take(window).filter(|s| !s.success).count();
        failures as f64 / window as f64
    }

    pub fn stats(&self, component: &str) -> Option<ComponentStats> {
        let samples = self.samples.read();
        samples.get(component).map(|ring| summarize(component, ring))
    }

    /// Stats for every component, sorted by name.
    pub fn snapshot(&self) -> Vec<ComponentStats> {
        let samples = self.samples.read();
        let mut all: Vec<ComponentStats> = samples
            .iter()
            .map(|(name, ring)| summarize(name, ring))
            .collect();
        all.sort_by(|a, b| a.component.cmp(&b.component));
        all
    }
}

pub fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn summarize(component: &str, ring: &VecDeque<Sample>) -> ComponentStats {
    let count = ring.len();
    let failures = ring.iter().filter(|s| !s.success).count();
    let mut durations: Vec<f64> = ring.iter().map(|s| s.duration_ms).collect();
    durations.sort_by(|a, b| a.total_cmp(b));

    let mean_ms = if count == 0 {
        0.0
    } else {
        durations.iter().sum::<f64>() / count as f64
    };
    let p95_ms = if count == 0 {
        0.0
    } else {
        let rank = ((count as f64) * 0.95).ceil() as usize;
        durations[rank.clamp(1, count) - 1]
    };

    ComponentStats {
        component: component.to_string(),
        count,
        failures,
        failure_rate: if count == 0 { 0.0 } else { failures as f64 / count as f64 },
        mean_ms,
        p95_ms,
        max_ms: durations.last().copied().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::config::CircuitBreakerConfig;
    use mnemos_common::MnemosError;

    #[test]
    fn failure_rate_uses_most_recent_window() {
        let monitor = PerformanceMonitor::new(100);
        for _ in 0..6 {
            monitor.record_sample("detector", 10.0, true);
        }
        for _ in 0..4 {
            monitor.record_sample("detector", 10.0, false);
        }
        assert!((monitor.current_failure_rate("detector", 10) - 0.4).abs() < 1e-9);
        assert!((monitor.current_failure_rate("detector", 4) - 1.0).abs() < 1e-9);
        assert!((monitor.current_failure_rate("detector", 1000) - 0.4).abs() < 1e-9);
        assert_eq!(monitor.current_failure_rate("unknown", 10), 0.0);
        assert_eq!(monitor.current_failure_rate("detector", 0), 0.0);
    }

    #[test]
    fn ring_is_bounded() {
        let monitor = PerformanceMonitor::new(3);
        monitor.record_sample("embedding", 1.0, false);
        for _ in 0..3 {
            monitor.record_sample("embedding", 2.0, true);
        }
        let stats = monitor.stats("embedding").unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn stats_report_latency_distribution() {
        let monitor = PerformanceMonitor::new(1000);
        for ms in 1..=100 {
            monitor.record_sample("retrieval", ms as f64, ms % 10 != 0);
        }
        let stats = monitor.stats("retrieval").unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.failures, 10);
        assert!((stats.mean_ms - 50.5).abs() < 1e-9);
        assert!((stats.p95_ms - 95.0).abs() < 1e-9);
        assert!((stats.max_ms - 100.0).abs() < 1e-9);

        monitor.record_sample("detector", 5.0, true);
        let names: Vec<String> = monitor.snapshot().into_iter().map(|s| s.component).collect();
        assert_eq!(names, vec!["detector", "retrieval"]);
    }

    #[test]
    fn attached_breaker_receives_samples() {
        let monitor = PerformanceMonitor::new(100);
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown_ms: 60_000,
        }));
        monitor.attach_breaker(components::BACKGROUND_TASK, breaker.clone());

        monitor.record_sample("detector", 1.0, false);
        monitor.record_sample("detector", 1.0, false);
        assert_eq!(breaker.state(), CircuitState::Closed);

        monitor.record_sample(components::BACKGROUND_TASK, 1.0, false);
        monitor.record_sample(components::BACKGROUND_TASK, 1.0, false);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn observe_records_outcome() {
        let monitor = PerformanceMonitor::new(10);
        let ok: Result<u32> = monitor.observe("embedding", async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let err: Result<u32> = monitor
            .observe("embedding", async { Err(MnemosError::EmbeddingUnavailable("down".into())) })
            .await;
        assert!(err.is_err());
        let stats = monitor.stats("embedding").unwrap();
        assert_eq!((stats.count, stats.failures), (2, 1));
    }
}
