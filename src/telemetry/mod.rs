//! Telemetry seam between the exporter core and the tracing/logging/metrics
//! backend.
//!
//! The exporter only ever talks to these traits. `OtlpTelemetry` ships the
//! data over OTLP/HTTP; tests use an in-memory recorder instead.

mod otlp;
#[cfg(test)]
pub mod recording;

use chrono::{DateTime, Utc};

use crate::attributes::FlatAttributeMap;
use crate::error::Result;

pub use otlp::OtlpTelemetry;

/// Immutable token identifying an open or closed span, passed by value to
/// children so they can be parented to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Server,
    Consumer,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Factory for per-entity tracers, loggers and meters.
///
/// `resource` is the attribute set identifying the entity; every signal
/// produced through the returned handle carries it.
pub trait Telemetry {
    fn tracer(&self, resource: &FlatAttributeMap) -> Result<Box<dyn SpanTracer>>;
    fn logger(&self, resource: &FlatAttributeMap) -> Result<Box<dyn RecordLogger>>;
    fn meter(&self, resource: &FlatAttributeMap) -> Result<Box<dyn MetricRecorder>>;
}

pub trait SpanTracer {
    /// Opens a span. Without `start` the span starts at call time.
    fn start_span(
        &self,
        name: &str,
        parent: Option<SpanContext>,
        start: Option<DateTime<Utc>>,
        kind: SpanKind,
    ) -> Box<dyn SpanHandle>;
}

pub trait SpanHandle {
    fn context(&self) -> SpanContext;
    fn set_attributes(&mut self, attributes: &FlatAttributeMap);
    fn set_status(&mut self, status: SpanStatus);

    /// Closes the span. `None` closes it at its own start time, so the span
    /// never picks up wall-clock duration.
    fn end(self: Box<Self>, end: Option<DateTime<Utc>>);
}

pub trait RecordLogger {
    fn emit(&self, severity: Severity, body: &str);
}

pub trait MetricRecorder {
    fn add_counter(&self, name: &str, value: f64, attributes: &FlatAttributeMap);
}
