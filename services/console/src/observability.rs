//! Tracing, trace-context and metrics setup for the console process.
//!
//! # Purpose
//! - Install the `tracing` subscriber once: `RUST_LOG` filtering, human-readable output and, when
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` is set, span export over OTLP.
//! - Recover the caller's W3C `traceparent` so request spans join the caller's trace.
//! - Own the Prometheus recorder that backs the `/metrics` listener.
//!
//! # Notes
//! Every entry point is safe to call repeatedly; tests and `main` share one recorder.
use anyhow::Context as _;
use axum::http::HeaderMap;
use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::{Mutex, OnceLock};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Resource attribute keys filled from the pod's downward-API environment.
const POD_ATTRIBUTES: [(&str, &str); 2] = [
    ("k8s.namespace.name", "K8S_NAMESPACE_NAME"),
    ("k8s.pod.name", "K8S_POD_NAME"),
];

static SUBSCRIBER: OnceLock<()> = OnceLock::new();
static RECORDER: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Install logging and the metrics recorder; returns the handle `/metrics` renders from.
pub fn init_observability(service_name: &str) -> anyhow::Result<PrometheusHandle> {
    SUBSCRIBER.get_or_init(|| install_subscriber(service_name));
    metrics_recorder()
}

fn install_subscriber(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    let installed = match otlp_provider(service_name) {
        Some(provider) => registry
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("console")))
            .try_init(),
        None => registry.try_init(),
    };
    if installed.is_ok() {
        tracing::debug!(service = service_name, "tracing subscriber installed");
    }
}

fn otlp_provider(service_name: &str) -> Option<SdkTracerProvider> {
    std::env::var_os(OTLP_ENDPOINT_ENV)?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder().with_tonic().build() {
        Ok(exporter) => exporter,
        Err(err) => {
            eprintln!("otlp exporter disabled: {err}");
            return None;
        }
    };
    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                Resource::builder_empty()
                    .with_attributes(resource_attributes(service_name))
                    .build(),
            )
            .build(),
    )
}

fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let instance = std::env::var("CONSOLE_INSTANCE_ID").or_else(|_| std::env::var("HOSTNAME"));
    std::iter::once(KeyValue::new("service.name", service_name.to_string()))
        .chain(instance.ok().map(|id| KeyValue::new("service.instance.id", id)))
        .chain(POD_ATTRIBUTES.iter().filter_map(|(key, env)| {
            std::env::var(env)
                .ok()
                .map(|value| KeyValue::new(*key, value))
        }))
        .collect()
}

/// Parent context carried by the request's `traceparent` header, or an empty context.
pub fn trace_context_from_headers(headers: &HeaderMap) -> opentelemetry::Context {
    TraceContextPropagator::new().extract(&Headers(headers))
}

struct Headers<'a>(&'a HeaderMap);

impl Extractor for Headers<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

/// Serve `GET /metrics` on `listener` until the task is aborted.
pub async fn serve_metrics(handle: PrometheusHandle, listener: TcpListener) -> std::io::Result<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || std::future::ready(handle.render())),
    );
    axum::serve(listener, app.into_make_service()).await
}

fn metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let mut slot = RECORDER
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;
    describe_console_metrics();
    *slot = Some(handle.clone());
    Ok(handle)
}

fn describe_console_metrics() {
    describe_counter!(
        "console_store_writes_total",
        "Documents written through the query layer, by operation."
    );
    describe_counter!("console_watcher_reopens_total", "Change cursors reopened after dying.");
    describe_histogram!(
        "console_convergence_seconds",
        Unit::Seconds,
        "Time for a namespace create to be acknowledged externally and observed locally."
    );
    describe_counter!("console_notifications_total", "Notification documents written by fan-out.");
    describe_counter!(
        "console_fanout_failures_total",
        "Fan-out runs that failed after the triggering mutation succeeded."
    );
    describe_counter!("console_digest_runs_total", "Digest loop iterations, by outcome.");
}
