//! In-memory telemetry backend used by tests.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{
    MetricRecorder, RecordLogger, Severity, SpanContext, SpanHandle, SpanKind, SpanStatus,
    SpanTracer, Telemetry,
};
use crate::attributes::FlatAttributeMap;
use crate::error::{ExporterError, Result};

#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub name: String,
    pub kind: SpanKind,
    pub context: SpanContext,
    pub parent: Option<SpanContext>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub ended: bool,
    pub status: SpanStatus,
    pub attributes: FlatAttributeMap,
    pub resource: FlatAttributeMap,
}

#[derive(Debug, Clone)]
pub struct RecordedLog {
    pub severity: Severity,
    pub body: String,
    pub resource: FlatAttributeMap,
}

#[derive(Debug, Clone)]
pub struct RecordedMetric {
    pub name: String,
    pub value: f64,
    pub attributes: FlatAttributeMap,
    pub resource: FlatAttributeMap,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    spans: Vec<RecordedSpan>,
    logs: Vec<RecordedLog>,
    metrics: Vec<RecordedMetric>,
    fail_tracer_for: Option<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingTelemetry {
    state: Arc<Mutex<State>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `tracer()` fail for resources carrying `key=value`.
    pub fn fail_tracer_for(&self, key: &str, value: &str) {
        self.lock().fail_tracer_for = Some((key.to_string(), value.to_string()));
    }

    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.lock().spans.clone()
    }

    pub fn span(&self, name: &str) -> RecordedSpan {
        self.spans()
            .into_iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no span named '{name}' in {:?}", self.span_names()))
    }

    pub fn span_names(&self) -> Vec<String> {
        self.lock().spans.iter().map(|s| s.name.clone()).collect()
    }

    pub fn logs(&self) -> Vec<RecordedLog> {
        self.lock().logs.clone()
    }

    pub fn metrics(&self) -> Vec<RecordedMetric> {
        self.lock().metrics.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

impl Telemetry for RecordingTelemetry {
    fn tracer(&self, resource: &FlatAttributeMap) -> Result<Box<dyn SpanTracer>> {
        if let Some((key, value)) = &self.lock().fail_tracer_for {
            if resource.get(key) == Some(value) {
                return Err(ExporterError::Telemetry("tracer unavailable".to_string()));
            }
        }
        Ok(Box::new(RecordingTracer {
            state: Arc::clone(&self.state),
            resource: resource.clone(),
        }))
    }

    fn logger(&self, resource: &FlatAttributeMap) -> Result<Box<dyn RecordLogger>> {
        Ok(Box::new(RecordingLogger {
            state: Arc::clone(&self.state),
            resource: resource.clone(),
        }))
    }

    fn meter(&self, resource: &FlatAttributeMap) -> Result<Box<dyn MetricRecorder>> {
        Ok(Box::new(RecordingMeter {
            state: Arc::clone(&self.state),
            resource: resource.clone(),
        }))
    }
}

struct RecordingTracer {
    state: Arc<Mutex<State>>,
    resource: FlatAttributeMap,
}

impl SpanTracer for RecordingTracer {
    fn start_span(
        &self,
        name: &str,
        parent: Option<SpanContext>,
        start: Option<DateTime<Utc>>,
        kind: SpanKind,
    ) -> Box<dyn SpanHandle> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let span_id = state.next_id;
        let context = SpanContext {
            trace_id: parent.map_or(u128::from(span_id), |p| p.trace_id),
            span_id,
        };

        let index = state.spans.len();
        state.spans.push(RecordedSpan {
            name: name.to_string(),
            kind,
            context,
            parent,
            start,
            end: None,
            ended: false,
            status: SpanStatus::Unset,
            attributes: FlatAttributeMap::new(),
            resource: self.resource.clone(),
        });

        Box::new(RecordingSpan {
            state: Arc::clone(&self.state),
            index,
            context,
        })
    }
}

struct RecordingSpan {
    state: Arc<Mutex<State>>,
    index: usize,
    context: SpanContext,
}

impl RecordingSpan {
    fn with_span(&self, f: impl FnOnce(&mut RecordedSpan)) {
        let mut state = self.state.lock().unwrap();
        let span = &mut state.spans[self.index];
        assert!(!span.ended, "span '{}' modified after end", span.name);
        f(span);
    }
}

impl SpanHandle for RecordingSpan {
    fn context(&self) -> SpanContext {
        self.context
    }

    fn set_attributes(&mut self, attributes: &FlatAttributeMap) {
        self.with_span(|span| span.attributes.extend(attributes.clone()));
    }

    fn set_status(&mut self, status: SpanStatus) {
        self.with_span(|span| span.status = status);
    }

    fn end(self: Box<Self>, end: Option<DateTime<Utc>>) {
        self.with_span(|span| {
            span.end = end.or(span.start);
            span.ended = true;
        });
    }
}

struct RecordingLogger {
    state: Arc<Mutex<State>>,
    resource: FlatAttributeMap,
}

impl RecordLogger for RecordingLogger {
    fn emit(&self, severity: Severity, body: &str) {
        self.state.lock().unwrap().logs.push(RecordedLog {
            severity,
            body: body.to_string(),
            resource: self.resource.clone(),
        });
    }
}

struct RecordingMeter {
    state: Arc<Mutex<State>>,
    resource: FlatAttributeMap,
}

impl MetricRecorder for RecordingMeter {
    fn add_counter(&self, name: &str, value: f64, attributes: &FlatAttributeMap) {
        self.state.lock().unwrap().metrics.push(RecordedMetric {
            name: name.to_string(),
            value,
            attributes: attributes.clone(),
            resource: self.resource.clone(),
        });
    }
}
