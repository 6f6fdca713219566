use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::collections::HashSet;

pub struct Metrics {
    request_counter: IntCounterVec,
    detection_outcomes: IntCounterVec,
    worker_duration: HistogramVec,
    workers_active: IntGauge,
    workers_queued: IntGauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_counter = IntCounterVec::new(
            Opts::new("requests_total", "Total number of requests"),
            &["route"],
        )?;

        let detection_outcomes = IntCounterVec::new(
            Opts::new("detections_total", "Detection requests by outcome"),
            &["outcome"],
        )?;

        let boundaries = generate_boundaries((10, 100, 200, 1000, 5000));

        let worker_duration = HistogramVec::new(
            HistogramOpts::new(
                "worker_duration_ms",
                "Duration of worker invocations in milliseconds",
            )
            .buckets(boundaries),
            &["outcome"],
        )?;

        let workers_active = IntGauge::new("workers_active", "Worker processes currently running")?;
        let workers_queued = IntGauge::new("workers_queued", "Requests waiting for a worker slot")?;

        registry.register(Box::new(request_counter.clone()))?;
        registry.register(Box::new(detection_outcomes.clone()))?;
        registry.register(Box::new(worker_duration.clone()))?;
        registry.register(Box::new(workers_active.clone()))?;
        registry.register(Box::new(workers_queued.clone()))?;

        Ok(Metrics {
            request_counter,
            detection_outcomes,
            worker_duration,
            workers_active,
            workers_queued,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        self.request_counter.with_label_values(&[route]).inc();
    }

    pub fn record_detection(&self, outcome: &str) {
        self.detection_outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn record_worker_duration(&self, duration_ms: u64, outcome: &str) {
        self.worker_duration
            .with_label_values(&[outcome])
            .observe(duration_ms as f64);
    }

    pub fn record_pool(&self, active: usize, queued: usize) {
        self.workers_active.set(active as i64);
        self.workers_queued.set(queued as i64);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 25;
    let end_step: usize = 100;
    let tail_step: usize = 1000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
