//! Audit events and the sinks they are delivered to

pub mod batching;
pub mod emitter;
pub mod event;
pub mod sinks;

pub use batching::{BatchingHttpSink, BatchingSinkConfig};
pub use emitter::Emitter;
pub use event::{AuditEvent, EventType, Outcome};
pub use sinks::{CallbackSink, EventMap, FileSink, Sink, SinkError, StdoutSink, SyslogSink, TracingSink};
