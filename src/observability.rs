use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::metrics::Counter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tokio::runtime::Runtime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
const OTLP_ENDPOINT_OVERRIDE_ENV: &str = "RUSTY_OTA_OTEL_EXPORTER_OTLP_ENDPOINT";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const DEFAULT_SERVICE_NAME: &str = "rusty-ota";
const DEFAULT_METRIC_EXPORT_INTERVAL_SECS: u64 = 15;

static ACTIVATIONS_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static ROLLBACKS_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static INTEGRITY_FAILURES_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();

/// Keeps the tracing/metrics pipeline alive; flushes exporters on drop.
///
/// Must be created and dropped outside of any tokio runtime, since it owns
/// the exporter runtime.
pub struct ObservabilityGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    _exporter_runtime: Option<Runtime>,
}

impl ObservabilityGuard {
    pub fn init() -> Self {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match setup_otel_pipeline() {
            Ok(pipeline) => {
                let tracer = pipeline.tracer_provider.tracer("rusty-ota-observability");
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_target(false)
                            .with_writer(std::io::stderr),
                    )
                    .with(otel_layer)
                    .try_init();

                init_instruments();
                emit_event(
                    "observability_init",
                    serde_json::json!({ "status": "ok", "otlp_endpoint": pipeline.endpoint }),
                );

                Self {
                    tracer_provider: Some(pipeline.tracer_provider),
                    meter_provider: Some(pipeline.meter_provider),
                    _exporter_runtime: Some(pipeline.runtime),
                }
            }
            Err(err) => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_target(false)
                            .with_writer(std::io::stderr),
                    )
                    .try_init();
                emit_event(
                    "observability_init",
                    serde_json::json!({ "status": "degraded", "message": err.to_string() }),
                );
                Self {
                    tracer_provider: None,
                    meter_provider: None,
                    _exporter_runtime: None,
                }
            }
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self.meter_provider.as_ref() {
            if let Err(err) = meter_provider.force_flush() {
                emit_shutdown_error("metrics", "flush_error", &err.to_string());
            }
            if let Err(err) = meter_provider.shutdown() {
                emit_shutdown_error("metrics", "shutdown_error", &err.to_string());
            }
        }

        if let Some(tracer_provider) = self.tracer_provider.as_ref() {
            let flush_errors = tracer_provider
                .force_flush()
                .into_iter()
                .filter_map(|result| result.err().map(|err| err.to_string()))
                .collect::<Vec<_>>();
            if !flush_errors.is_empty() {
                emit_shutdown_error("traces", "flush_error", &flush_errors.join("; "));
            }
            if let Err(err) = tracer_provider.shutdown() {
                emit_shutdown_error("traces", "shutdown_error", &err.to_string());
            }
        }
    }
}

/// Prints a single-line JSON event on stderr. `fields` must be a JSON object.
pub fn emit_event(event: &str, fields: serde_json::Value) {
    let mut payload = serde_json::Map::new();
    payload.insert("event".to_string(), serde_json::Value::from(event));
    if let serde_json::Value::Object(extra) = fields {
        payload.extend(extra);
    }
    eprintln!("{}", serde_json::Value::Object(payload));
}

fn emit_shutdown_error(component: &str, status: &str, message: &str) {
    emit_event(
        "observability_shutdown",
        serde_json::json!({ "component": component, "status": status, "message": message }),
    );
}

struct PipelineState {
    runtime: Runtime,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    endpoint: String,
}

fn setup_otel_pipeline() -> Result<PipelineState> {
    let endpoint = env::var(OTLP_ENDPOINT_OVERRIDE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string());
    let service_name = env::var("OTEL_SERVICE_NAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let export_interval_secs = env::var("OTEL_METRIC_EXPORT_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_METRIC_EXPORT_INTERVAL_SECS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .thread_name("rusty-ota-otel")
        .build()
        .context("failed building tokio runtime for OpenTelemetry")?;
    let _runtime_guard = runtime.enter();

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP metric exporter")?;

    let periodic_reader =
        PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(export_interval_secs))
            .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(periodic_reader)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(PipelineState {
        runtime,
        tracer_provider,
        meter_provider,
        endpoint,
    })
}

fn init_instruments() {
    let meter = global::meter("rusty-ota");

    let _ = ACTIVATIONS_COUNTER.get_or_init(|| {
        meter
            .u64_counter("bundle_activations_total")
            .with_description("Bundles made current, by activation source.")
            .build()
    });
    let _ = ROLLBACKS_COUNTER.get_or_init(|| {
        meter
            .u64_counter("bundle_rollbacks_total")
            .with_description("Rollbacks away from a failed bundle, by reason.")
            .build()
    });
    let _ = INTEGRITY_FAILURES_COUNTER.get_or_init(|| {
        meter
            .u64_counter("integrity_failures_total")
            .with_description("Bundles rejected by checksum or manifest verification.")
            .build()
    });
}

pub fn record_activation(source: &str) {
    if let Some(counter) = ACTIVATIONS_COUNTER.get() {
        counter.add(1, &[KeyValue::new("source", source.to_string())]);
    }
}

pub fn record_rollback(reason: &str) {
    if let Some(counter) = ROLLBACKS_COUNTER.get() {
        counter.add(1, &[KeyValue::new("reason", reason.to_string())]);
    }
}

pub fn record_integrity_failure(source: &str) {
    if let Some(counter) = INTEGRITY_FAILURES_COUNTER.get() {
        counter.add(1, &[KeyValue::new("source", source.to_string())]);
    }
}
