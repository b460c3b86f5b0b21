//! Logging setup and the recent-log ring buffer
//!
//! Console output goes through a compact `tracing` fmt layer; a second
//! layer mirrors every event into a bounded in-memory buffer so embedders
//! (mobile UIs in particular) can show recent activity without a console.

use std::collections::VecDeque;
use std::sync::{Mutex, Once};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::LogLevel;
use crate::error::{Error, Result};

static INIT: Once = Once::new();

const LOG_BUFFER_CAPACITY: usize = 1000;

static LOG_BUFFER: once_cell::sync::Lazy<Mutex<LogBuffer>> =
    once_cell::sync::Lazy::new(|| Mutex::new(LogBuffer::new(LOG_BUFFER_CAPACITY)));

/// Bounded FIFO of recent formatted log lines.
struct LogBuffer {
    lines: VecDeque<String>,
    max_size: usize,
}

impl LogBuffer {
    fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self, count: usize) -> Vec<String> {
        if count == 0 || count >= self.lines.len() {
            return self.lines.iter().cloned().collect();
        }
        let start = self.lines.len() - count;
        self.lines.iter().skip(start).cloned().collect()
    }
}

/// The most recent `count` log lines; `count == 0` returns everything
/// buffered.
pub fn get_recent_logs(count: usize) -> Vec<String> {
    match LOG_BUFFER.lock() {
        Ok(buffer) => buffer.tail(count),
        Err(_) => Vec::new(),
    }
}

/// Drop everything in the log buffer.
pub fn clear_logs() {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.lines.clear();
    }
}

fn add_log(line: String) {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.push(line);
    }
}

/// Initialize the tracing subscriber once for the whole process. Safe to
/// call from every `start()`; later calls are no-ops, and an embedder that
/// installed its own subscriber first wins (the ring buffer then stays
/// empty).
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_inner(level);
    });
    result
}

fn init_inner(level: LogLevel) -> Result<()> {
    let level = match level {
        LogLevel::Silent => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(parse_directive(&format!("quicgate_core={}", level))?)
        .add_directive(parse_directive(&format!("quicgate_proto={}", level))?)
        .add_directive(parse_directive(&format!("quicgate_server={}", level))?)
        .add_directive(parse_directive("quinn=warn")?)
        .add_directive(parse_directive("rustls=warn")?)
        .add_directive(parse_directive("tokio=warn")?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(filter);

    let result = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BufferLayer)
        .try_init();

    if result.is_ok() {
        tracing::info!("logging initialized at level {}", level);
    }
    Ok(())
}

fn parse_directive(directive: &str) -> Result<tracing_subscriber::filter::Directive> {
    directive
        .parse()
        .map_err(|e| Error::config(format!("invalid log directive '{}': {}", directive, e)))
}

/// Layer mirroring events into the ring buffer.
struct BufferLayer;

impl<S> tracing_subscriber::Layer<S> for BufferLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let metadata = event.metadata();
        let target = metadata.target();
        if !target.starts_with("quicgate") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        add_log(format!(
            "[{}] [{}] {}",
            timestamp,
            metadata.level(),
            visitor.message
        ));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = value.to_string();
        } else {
            self.message.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = format!("{:?}", value);
        } else {
            self.message.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}
