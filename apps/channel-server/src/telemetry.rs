use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "channel-server";
const OTEL_STDOUT_ENV: &str = "CHANNEL_SERVER_OTEL_STDOUT";

pub const BACK_CHUNK_BYTES: &str = "channel_server_back_chunk_bytes";

/// Chunk sizes range from a lone `noop` to the 1 MiB cap.
const BACK_CHUNK_BUCKETS: &[f64] = &[
    32.0, 256.0, 1024.0, 4096.0, 10240.0, 65536.0, 262144.0, 1048576.0,
];

/// Process-wide logging, tracing and metrics setup. Dropping it flushes the
/// tracer provider.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(BACK_CHUNK_BYTES.to_string()), BACK_CHUNK_BUCKETS)
            .context("invalid back chunk histogram buckets")?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(|| {
            SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                        .build(),
                )
                .build()
        });
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shut down OpenTelemetry tracer provider");
            }
        }
    }
}

/// Help text for every series the server exports.
fn describe_metrics() {
    describe_counter!(
        "channel_server_sessions_opened_total",
        "Sessions created by a handshake"
    );
    describe_counter!(
        "channel_server_sessions_reclaimed_total",
        "Sessions dropped after their back channel stayed away past the reopen window"
    );
    describe_gauge!("channel_server_sessions_active", "Sessions currently registered");
    describe_counter!(
        "channel_server_handshakes_total",
        "Handshake requests by outcome"
    );
    describe_counter!(
        "channel_server_network_tests_total",
        "Buffering-proxy checks served"
    );
    describe_counter!(
        "channel_server_maps_received_total",
        "Forward maps handed to the application in order"
    );
    describe_counter!(
        "channel_server_bad_map_batches_total",
        "Forward batches rejected as malformed or out of window"
    );
    describe_counter!(
        "channel_server_arrays_sent_total",
        "Arrays queued for the back channel"
    );
    describe_counter!(
        "channel_server_back_channels_total",
        "Back channel requests attached, by mode"
    );
    describe_histogram!(
        BACK_CHUNK_BYTES,
        Unit::Bytes,
        "Size of each chunk written to a back channel"
    );
    describe_counter!(
        "channel_server_demo_maps_total",
        "Maps handled by the demo service"
    );
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).is_ok_and(|val| {
        matches!(
            val.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
