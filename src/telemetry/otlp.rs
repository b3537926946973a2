use std::collections::HashMap;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::{debug, error};
use opentelemetry::logs::{AnyValue, LogRecord as _, Logger as _, LoggerProvider as _};
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::{
    Span as _, SpanContext as OtelSpanContext, SpanId, Status, TraceContextExt as _, TraceFlags,
    TraceId, TraceState, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::{
    LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig, WithHttpConfig,
};
use opentelemetry_sdk::logs::{SdkLogger, SdkLoggerProvider};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use opentelemetry_sdk::Resource;

use super::{
    MetricRecorder, RecordLogger, Severity, SpanContext, SpanHandle, SpanKind, SpanStatus,
    SpanTracer, Telemetry,
};
use crate::attributes::FlatAttributeMap;
use crate::auth::Token;
use crate::error::{ExporterError, Result};

const INSTRUMENTATION_SCOPE: &str = "gitlab-exporter";

/// OTLP/HTTP (protobuf) backend.
///
/// Every call builds a dedicated provider for the given resource. The
/// provider is shut down, and therefore flushed, when the returned handle is
/// dropped.
pub struct OtlpTelemetry {
    endpoint: String,
    headers: HashMap<String, String>,
}

impl OtlpTelemetry {
    pub fn new(endpoint: &str, api_key: &Token) -> Self {
        let mut headers = HashMap::new();
        headers.insert("api-key".to_string(), api_key.as_str().to_string());

        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            headers,
        }
    }

    fn signal_url(&self, signal: &str) -> String {
        format!("{}/v1/{signal}", self.endpoint)
    }
}

fn to_resource(attributes: &FlatAttributeMap) -> Resource {
    Resource::builder_empty()
        .with_attributes(to_key_values(attributes))
        .build()
}

fn to_key_values(attributes: &FlatAttributeMap) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
        .collect()
}

fn build_error(signal: &str, err: impl std::fmt::Display) -> ExporterError {
    ExporterError::Telemetry(format!("Failed to build OTLP {signal} exporter: {err}"))
}

impl Telemetry for OtlpTelemetry {
    fn tracer(&self, resource: &FlatAttributeMap) -> Result<Box<dyn SpanTracer>> {
        let exporter = SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(self.signal_url("traces"))
            .with_headers(self.headers.clone())
            .build()
            .map_err(|e| build_error("span", e))?;

        let provider = SdkTracerProvider::builder()
            .with_resource(to_resource(resource))
            .with_batch_exporter(exporter)
            .build();
        let tracer = provider.tracer(INSTRUMENTATION_SCOPE);

        Ok(Box::new(OtlpTracer { provider, tracer }))
    }

    fn logger(&self, resource: &FlatAttributeMap) -> Result<Box<dyn RecordLogger>> {
        let exporter = LogExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(self.signal_url("logs"))
            .with_headers(self.headers.clone())
            .build()
            .map_err(|e| build_error("log", e))?;

        let provider = SdkLoggerProvider::builder()
            .with_resource(to_resource(resource))
            .with_batch_exporter(exporter)
            .build();
        let logger = provider.logger(INSTRUMENTATION_SCOPE);

        Ok(Box::new(OtlpLogger { provider, logger }))
    }

    fn meter(&self, resource: &FlatAttributeMap) -> Result<Box<dyn MetricRecorder>> {
        let exporter = MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(self.signal_url("metrics"))
            .with_headers(self.headers.clone())
            .build()
            .map_err(|e| build_error("metric", e))?;

        let provider = SdkMeterProvider::builder()
            .with_periodic_exporter(exporter)
            .with_resource(to_resource(resource))
            .build();

        Ok(Box::new(OtlpMeter { provider }))
    }
}

fn to_otel_context(context: SpanContext) -> Context {
    Context::new().with_remote_span_context(OtelSpanContext::new(
        TraceId::from_bytes(context.trace_id.to_be_bytes()),
        SpanId::from_bytes(context.span_id.to_be_bytes()),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    ))
}

fn to_otel_kind(kind: SpanKind) -> opentelemetry::trace::SpanKind {
    match kind {
        SpanKind::Server => opentelemetry::trace::SpanKind::Server,
        SpanKind::Consumer => opentelemetry::trace::SpanKind::Consumer,
        SpanKind::Client => opentelemetry::trace::SpanKind::Client,
    }
}

struct OtlpTracer {
    provider: SdkTracerProvider,
    tracer: SdkTracer,
}

impl SpanTracer for OtlpTracer {
    fn start_span(
        &self,
        name: &str,
        parent: Option<SpanContext>,
        start: Option<DateTime<Utc>>,
        kind: SpanKind,
    ) -> Box<dyn SpanHandle> {
        let start = start.map_or_else(SystemTime::now, SystemTime::from);
        let parent_cx = parent.map_or_else(Context::new, to_otel_context);

        let span = self
            .tracer
            .span_builder(name.to_string())
            .with_kind(to_otel_kind(kind))
            .with_start_time(start)
            .start_with_context(&self.tracer, &parent_cx);

        Box::new(OtlpSpan { span, start })
    }
}

impl Drop for OtlpTracer {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            error!("Failed to flush spans: {e}");
        }
    }
}

struct OtlpSpan {
    span: opentelemetry_sdk::trace::Span,
    start: SystemTime,
}

impl SpanHandle for OtlpSpan {
    fn context(&self) -> SpanContext {
        let context = self.span.span_context();
        SpanContext {
            trace_id: u128::from_be_bytes(context.trace_id().to_bytes()),
            span_id: u64::from_be_bytes(context.span_id().to_bytes()),
        }
    }

    fn set_attributes(&mut self, attributes: &FlatAttributeMap) {
        self.span.set_attributes(to_key_values(attributes));
    }

    fn set_status(&mut self, status: SpanStatus) {
        let status = match status {
            SpanStatus::Unset => Status::Unset,
            SpanStatus::Ok => Status::Ok,
            SpanStatus::Error(message) => Status::error(message),
        };
        self.span.set_status(status);
    }

    fn end(mut self: Box<Self>, end: Option<DateTime<Utc>>) {
        let end = end.map_or(self.start, SystemTime::from);
        self.span.end_with_timestamp(end);
    }
}

struct OtlpLogger {
    provider: SdkLoggerProvider,
    logger: SdkLogger,
}

impl RecordLogger for OtlpLogger {
    fn emit(&self, severity: Severity, body: &str) {
        let mut record = self.logger.create_log_record();
        match severity {
            Severity::Info => {
                record.set_severity_number(opentelemetry::logs::Severity::Info);
                record.set_severity_text("INFO");
            }
            Severity::Error => {
                record.set_severity_number(opentelemetry::logs::Severity::Error);
                record.set_severity_text("ERROR");
            }
        }
        record.set_body(AnyValue::from(body.to_string()));
        self.logger.emit(record);
    }
}

impl Drop for OtlpLogger {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            error!("Failed to flush log records: {e}");
        }
    }
}

struct OtlpMeter {
    provider: SdkMeterProvider,
}

impl MetricRecorder for OtlpMeter {
    fn add_counter(&self, name: &str, value: f64, attributes: &FlatAttributeMap) {
        debug!("Recording {name}={value}");
        self.provider
            .meter(INSTRUMENTATION_SCOPE)
            .f64_counter(name.to_string())
            .build()
            .add(value, &to_key_values(attributes));
    }
}

impl Drop for OtlpMeter {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            error!("Failed to flush metrics: {e}");
        }
    }
}
