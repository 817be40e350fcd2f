//! Fan-out of audit events to sinks

use std::sync::Arc;

use super::event::AuditEvent;
use super::sinks::{Sink, SinkError};

/// Writes every event to each of its sinks.
///
/// A failing sink never stops delivery to the others; the failures are
/// collected and returned together. An emitter without sinks is a no-op.
#[derive(Clone, Default)]
pub struct Emitter {
    sinks: Vec<Arc<dyn Sink>>,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").field("sinks", &self.sinks.len()).finish()
    }
}

impl Emitter {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub async fn emit(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let payload = event.to_map();
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.write(payload.clone()).await {
                errors.push(e);
            }
        }
        SinkError::aggregate(errors)
    }

    pub async fn flush(&self) -> Result<(), SinkError> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.flush().await {
                errors.push(e);
            }
        }
        SinkError::aggregate(errors)
    }

    pub async fn close(&self) -> Result<(), SinkError> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                errors.push(e);
            }
        }
        SinkError::aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{EventType, Outcome};
    use crate::audit::sinks::{CallbackSink, EventMap};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FailingSink(&'static str);

    #[async_trait]
    impl Sink for FailingSink {
        async fn write(&self, _event: EventMap) -> Result<(), SinkError> {
            Err(SinkError::Delivery(self.0.to_string()))
        }
        async fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), SinkError> {
            Err(SinkError::Delivery(self.0.to_string()))
        }
    }

    /// Mutates its copy so sharing would be visible to later sinks.
    struct MutatingSink;

    #[async_trait]
    impl Sink for MutatingSink {
        async fn write(&self, mut event: EventMap) -> Result<(), SinkError> {
            event.insert("subject".into(), "tampered".into());
            Ok(())
        }
        async fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn recorder() -> (Arc<dyn Sink>, Arc<Mutex<Vec<EventMap>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            CallbackSink::new(move |e| seen.lock().push(e))
        };
        (Arc::new(sink), seen)
    }

    fn event() -> AuditEvent {
        AuditEvent::new(EventType::AuthSuccess, "user-1", "login", "/app", Outcome::Success)
    }

    #[tokio::test]
    async fn test_no_sinks_is_noop() {
        let emitter = Emitter::default();
        assert!(emitter.emit(&event()).await.is_ok());
        assert!(emitter.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_each_sink_gets_its_own_copy() {
        let (recorder, seen) = recorder();
        let emitter = Emitter::new(vec![Arc::new(MutatingSink), recorder]);
        emitter.emit(&event()).await.unwrap();
        assert_eq!(seen.lock()[0]["subject"], "user-1");
    }

    #[tokio::test]
    async fn test_single_failure_is_returned_and_others_still_run() {
        let (recorder, seen) = recorder();
        let emitter = Emitter::new(vec![Arc::new(FailingSink("first")), recorder]);
        let err = emitter.emit(&event()).await.unwrap_err();
        assert!(matches!(err, SinkError::Delivery(ref m) if m == "first"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_the_other() {
        let (recorder, seen) = recorder();
        let emitter = Emitter::new(vec![Arc::new(FailingSink("boom")), recorder]);
        let err = emitter.emit(&event()).await.unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_multiple_failures_are_combined() {
        let emitter = Emitter::new(vec![
            Arc::new(FailingSink("first")),
            Arc::new(FailingSink("second")),
        ]);
        let err = emitter.emit(&event()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("multiple sink errors"));
        assert!(msg.contains("first") && msg.contains("second"));

        let err = emitter.close().await.unwrap_err();
        assert!(matches!(err, SinkError::Multiple(ref errs) if errs.len() == 2));
    }
}
