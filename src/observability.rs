use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tokio::runtime::Runtime;
use tracing::{debug, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "graceful-monitor";
const ENDPOINT_ENVS: [&str; 2] = [
    "GRACEFUL_MONITOR_OTEL_EXPORTER_OTLP_ENDPOINT",
    "OTEL_EXPORTER_OTLP_ENDPOINT",
];
const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_secs(15);

struct Instruments {
    rollout_runs: Counter<u64>,
    rule_changes: Counter<u64>,
    readiness_wait: Histogram<f64>,
}

static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

pub struct ObservabilityGuard {
    otlp: Option<OtlpPipeline>,
}

impl ObservabilityGuard {
    pub fn init() -> Self {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let (otlp, startup_error) = match OtlpConfig::from_env() {
            Some(config) => match OtlpPipeline::start(&config) {
                Ok(pipeline) => (Some(pipeline), None),
                Err(err) => (None, Some(err)),
            },
            None => (None, None),
        };

        let otel_layer = otlp.as_ref().map(|pipeline| {
            tracing_opentelemetry::layer().with_tracer(pipeline.tracer_provider.tracer(SERVICE_NAME))
        });
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(otel_layer)
            .try_init();

        if let Some(pipeline) = &otlp {
            register_instruments();
            debug!(otlp_endpoint = %pipeline.endpoint, "OTLP export enabled");
        }
        if let Some(err) = startup_error {
            warn!(error = %format!("{err:#}"), "OTLP export disabled");
        }

        Self { otlp }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(pipeline) = self.otlp.take() {
            pipeline.shutdown();
        }
    }
}

struct OtlpConfig {
    endpoint: String,
    service_name: String,
    export_interval: Duration,
}

impl OtlpConfig {
    fn from_env() -> Option<Self> {
        let endpoint = ENDPOINT_ENVS.into_iter().find_map(non_empty_env)?;
        let service_name =
            non_empty_env("OTEL_SERVICE_NAME").unwrap_or_else(|| SERVICE_NAME.to_string());
        let export_interval = non_empty_env("OTEL_METRIC_EXPORT_INTERVAL_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_EXPORT_INTERVAL);
        Some(Self {
            endpoint,
            service_name,
            export_interval,
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

struct OtlpPipeline {
    endpoint: String,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    _runtime: Runtime,
}

impl OtlpPipeline {
    fn start(config: &OtlpConfig) -> Result<Self> {
        let exporter_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .thread_name("graceful-monitor-otlp")
            .build()
            .context("failed building OTLP exporter runtime")?;
        let (tracer_provider, meter_provider) = {
            let _entered = exporter_runtime.enter();
            build_providers(config)?
        };

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Self {
            endpoint: config.endpoint.clone(),
            tracer_provider,
            meter_provider,
            _runtime: exporter_runtime,
        })
    }

    fn shutdown(self) {
        if let Err(err) = self
            .meter_provider
            .force_flush()
            .and_then(|()| self.meter_provider.shutdown())
        {
            eprintln!("graceful-monitor: metric export shutdown failed: {err}");
        }

        let failures = self
            .tracer_provider
            .force_flush()
            .into_iter()
            .filter_map(|result| result.err())
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        if !failures.is_empty() {
            eprintln!(
                "graceful-monitor: span flush failed: {}",
                failures.join("; ")
            );
        }
        if let Err(err) = self.tracer_provider.shutdown() {
            eprintln!("graceful-monitor: span export shutdown failed: {err}");
        }
    }
}

/// Must run inside the exporter runtime; the batch processors spawn onto it.
fn build_providers(config: &OtlpConfig) -> Result<(SdkTracerProvider, SdkMeterProvider)> {
    let resource = Resource::new([KeyValue::new("service.name", config.service_name.clone())]);

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.endpoint.clone())
        .build()
        .context("failed building OTLP span exporter")?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(spans, runtime::Tokio)
        .build();

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.endpoint.clone())
        .build()
        .context("failed building OTLP metric exporter")?;
    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(
            PeriodicReader::builder(metrics, runtime::Tokio)
                .with_interval(config.export_interval)
                .build(),
        )
        .build();

    Ok((tracer_provider, meter_provider))
}

fn register_instruments() {
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter(SERVICE_NAME);
        Instruments {
            rollout_runs: meter
                .u64_counter("rollout_runs_total")
                .with_description("Rollout passes by outcome and last phase reached.")
                .build(),
            rule_changes: meter
                .u64_counter("nat_rule_changes_total")
                .with_description("Rules appended to or deleted from the rewrite chain.")
                .build(),
            readiness_wait: meter
                .f64_histogram("readiness_wait_seconds")
                .with_description("Time spent waiting for a port to become reachable or refused.")
                .build(),
        }
    });
}

pub fn record_rollout_run(outcome: &str, phase: &str) {
    if let Some(instruments) = INSTRUMENTS.get() {
        instruments.rollout_runs.add(
            1,
            &[
                KeyValue::new("outcome", outcome.to_string()),
                KeyValue::new("phase", phase.to_string()),
            ],
        );
    }
}

pub fn record_rule_changes(operation: &str, appended: usize, deleted: usize) {
    let Some(instruments) = INSTRUMENTS.get() else {
        return;
    };
    for (kind, count) in [("append", appended), ("delete", deleted)] {
        if count > 0 {
            instruments.rule_changes.add(
                count as u64,
                &[
                    KeyValue::new("operation", operation.to_string()),
                    KeyValue::new("kind", kind),
                ],
            );
        }
    }
}

pub fn record_readiness_wait(expectation: &str, status: &str, waited: Duration) {
    if let Some(instruments) = INSTRUMENTS.get() {
        instruments.readiness_wait.record(
            waited.as_secs_f64(),
            &[
                KeyValue::new("expectation", expectation.to_string()),
                KeyValue::new("status", status.to_string()),
            ],
        );
    }
}
