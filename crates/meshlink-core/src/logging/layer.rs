//! `tracing` layer feeding a [`DeviceLogWriter`]

use std::fmt::Write as FmtWrite;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::entry::LogEntry;
use super::writer::DeviceLogWriter;

/// Writes every event it sees as one JSON line
pub struct JsonlLayer {
    writer: Arc<DeviceLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, device: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(DeviceLogWriter::new(logs_dir, device)?),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = LogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.device(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(Value::Object(visitor.fields));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans = scope.from_root().map(|s| s.name()).collect::<Vec<_>>();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        // Logging must never take the node down
        let _ = self.writer.write(&entry);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.put(field, Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.put(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}
