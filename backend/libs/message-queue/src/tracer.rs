//! Span capability used by the publish and dispatch paths.
//!
//! The queue only needs to open a span, attach errors to it and end it.
//! [`TracingTracer`] backs this with `tracing` spans so an OpenTelemetry layer
//! installed by the service picks them up unchanged.

use std::sync::Arc;
use tracing::field::Empty;

/// Opens spans for the queue's own operations.
///
/// There is no explicit parent argument. A span started here is a child of
/// whatever `tracing` span is current for the caller, and the derived context
/// for nested work is [`Span::tracing_span`]: futures run under the new span
/// are instrumented with it, so spans opened further down become its children.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &'static str) -> Box<dyn Span>;
}

pub trait Span: Send {
    fn record_error(&mut self, error: &dyn std::error::Error);

    fn end(self: Box<Self>);

    /// `tracing` span that work done under this span should be instrumented with.
    fn tracing_span(&self) -> tracing::Span {
        tracing::Span::none()
    }
}

/// Default tracer emitting `tracing` spans at INFO level.
#[derive(Debug, Clone, Default)]
pub struct TracingTracer;

impl TracingTracer {
    pub fn shared() -> Arc<dyn Tracer> {
        Arc::new(Self)
    }
}

impl Tracer for TracingTracer {
    fn start_span(&self, name: &'static str) -> Box<dyn Span> {
        let span = tracing::info_span!("message_queue", otel.name = name, error = Empty);
        Box::new(TracingSpan { span })
    }
}

struct TracingSpan {
    span: tracing::Span,
}

impl Span for TracingSpan {
    fn record_error(&mut self, error: &dyn std::error::Error) {
        self.span.record("error", tracing::field::display(error));
        tracing::error!(parent: &self.span, error = %error, "span error");
    }

    fn end(self: Box<Self>) {
        drop(self.span);
    }

    fn tracing_span(&self) -> tracing::Span {
        self.span.clone()
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// Tracer keeping span names and recorded errors in memory.
    #[derive(Default, Clone)]
    pub struct RecordingTracer {
        pub started: Arc<Mutex<Vec<&'static str>>>,
        pub ended: Arc<Mutex<Vec<&'static str>>>,
        pub errors: Arc<Mutex<Vec<(&'static str, String)>>>,
    }

    impl Tracer for RecordingTracer {
        fn start_span(&self, name: &'static str) -> Box<dyn Span> {
            self.started.lock().push(name);
            Box::new(RecordingSpan {
                name,
                tracer: self.clone(),
            })
        }
    }

    struct RecordingSpan {
        name: &'static str,
        tracer: RecordingTracer,
    }

    impl Span for RecordingSpan {
        fn record_error(&mut self, error: &dyn std::error::Error) {
            self.tracer.errors.lock().push((self.name, error.to_string()));
        }

        fn end(self: Box<Self>) {
            self.tracer.ended.lock().push(self.name);
        }
    }
}
