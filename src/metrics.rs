use opentelemetry::metrics::MeterProvider;
use opentelemetry::metrics::{Counter, Histogram, Meter, ObservableGauge};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::metrics::periodic_reader_with_async_runtime::PeriodicReader;
use opentelemetry_sdk::runtime;
use std::sync::{Arc, atomic::AtomicU64};
use std::time::Duration;

#[derive(Clone)]
pub struct Metrics {
    pub requests: Counter<u64>,
    pub errors: Counter<u64>,
    pub latency_ms: Histogram<f64>,
    _inflight: ObservableGauge<i64>,
}

pub fn init_metrics(
    service_name: String,
    endpoint: String,
    timeout_ms: u64,
    inflight_count: Arc<AtomicU64>,
) -> Result<Metrics, String> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_protocol(Protocol::Grpc)
        .with_timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| format!("metrics exporter init error: {}", e))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();

    let meter = provider.meter("codejoin-gateway");
    opentelemetry::global::set_meter_provider(provider);

    Ok(build_instruments(&meter, inflight_count))
}

pub fn init_metrics_noop(inflight_count: Arc<AtomicU64>) -> Metrics {
    let meter = opentelemetry::global::meter("codejoin-gateway");
    build_instruments(&meter, inflight_count)
}

fn build_instruments(meter: &Meter, inflight_count: Arc<AtomicU64>) -> Metrics {
    let requests = meter
        .u64_counter("gateway.requests")
        .with_description("Requests accepted, labeled by route")
        .build();
    let errors = meter
        .u64_counter("gateway.errors")
        .with_description("Failures, labeled by error type")
        .build();
    let latency_ms = meter
        .f64_histogram("gateway.latency_ms")
        .with_unit("ms")
        .with_description("Request latency in ms")
        .build();
    let inflight = meter
        .i64_observable_gauge("gateway.inflight")
        .with_description("In-flight requests")
        .with_callback(move |observer| {
            let value = inflight_count.load(std::sync::atomic::Ordering::Relaxed) as i64;
            observer.observe(value, &[]);
        })
        .build();

    Metrics {
        requests,
        errors,
        latency_ms,
        _inflight: inflight,
    }
}
