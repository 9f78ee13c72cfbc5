use std::time::Instant;

use anyhow::Result;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

pub fn init_provider() -> Result<Registry> {
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder()
        .with_resource(opentelemetry_sdk::Resource::new(vec![
            opentelemetry::KeyValue::new("service.name", "target-allocator"),
            opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .with_reader(exporter)
        .build();
    opentelemetry::global::set_meter_provider(provider);
    Ok(registry)
}

pub struct AllocatorMetrics {
    pub snapshots_applied: Counter<u64>,
    pub reshard_latency: Histogram<f64>,
}

impl AllocatorMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("target-allocator");
        let snapshots_applied = meter
            .u64_counter("snapshots_applied")
            .with_description("Consolidated target snapshots applied to the assignment")
            .build();
        let reshard_latency = meter
            .f64_histogram("reshard_latency")
            .with_unit("s")
            .with_description("Reshard latency in seconds")
            .build();
        Self {
            snapshots_applied,
            reshard_latency,
        }
    }
}

pub struct Timer<'a> {
    start: Instant,
    metric: &'a Histogram<f64>,
}

impl<'a> Timer<'a> {
    pub fn start(metric: &'a Histogram<f64>) -> Self {
        Self {
            start: Instant::now(),
            metric,
        }
    }
}

impl<'a> Drop for Timer<'a> {
    fn drop(&mut self) {
        self.metric
            .record(self.start.elapsed().as_secs_f64(), &[]);
    }
}
