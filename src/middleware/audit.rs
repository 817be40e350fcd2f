//! Audit stage.
//!
//! Outermost stage of the pipeline. It installs a [`ClaimsSlot`] so the
//! identity established further in is visible after the call returns, then
//! records one event per call. Sink failures never change the call result;
//! they are counted and logged instead.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::Response;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use super::error::Code;
use super::options::InterceptorConfig;
use crate::audit::{AuditEvent, Emitter, EventType, Outcome};
use crate::authz::{claims_from_request, ClaimsSlot};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

const ANONYMOUS: &str = "anonymous";
const RPC_ACTION: &str = "rpc";

#[derive(Clone)]
pub struct AuditLayer {
    emitter: Arc<Emitter>,
    config: Arc<InterceptorConfig>,
    dropped: Arc<AtomicU64>,
}

impl AuditLayer {
    pub fn new(emitter: Arc<Emitter>, config: Arc<InterceptorConfig>) -> Self {
        Self {
            emitter,
            config,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Events whose emission failed in at least one sink.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<S> Layer<S> for AuditLayer {
    type Service = AuditMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuditMiddleware {
            inner,
            emitter: self.emitter.clone(),
            config: self.config.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuditMiddleware<S> {
    inner: S,
    emitter: Arc<Emitter>,
    config: Arc<InterceptorConfig>,
    dropped: Arc<AtomicU64>,
}

/// Map a call result to the event it is recorded as.
///
/// A [`Code`] left in the response extensions by a rejecting stage wins over
/// the HTTP status. Anything that is neither a success nor an
/// authentication failure is recorded as a denial.
fn classify<E>(result: &Result<Response, E>) -> (EventType, Outcome) {
    let response = match result {
        Ok(response) => response,
        Err(_) => return (EventType::AuthzDenied, Outcome::Failure),
    };

    match response.extensions().get::<Code>() {
        Some(Code::Unauthenticated) => return (EventType::AuthFailure, Outcome::Failure),
        Some(_) => return (EventType::AuthzDenied, Outcome::Failure),
        None => {}
    }

    let status = response.status();
    if status.is_success() || status.is_redirection() || status.is_informational() {
        (EventType::AuthzGranted, Outcome::Success)
    } else if status == StatusCode::UNAUTHORIZED {
        (EventType::AuthFailure, Outcome::Failure)
    } else {
        (EventType::AuthzDenied, Outcome::Failure)
    }
}

impl<S> Service<Request> for AuditMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let emitter = self.emitter.clone();
        let config = self.config.clone();
        let dropped = self.dropped.clone();

        Box::pin(async move {
            let resource = request.uri().path().to_string();
            let outer_claims = claims_from_request(&request);
            let slot = ClaimsSlot::new();
            request.extensions_mut().insert(slot.clone());

            let result = inner.call(request).await;

            let (event_type, outcome) = classify(&result);
            if config.skips_audit(event_type) {
                return result;
            }

            let subject = slot
                .get()
                .or(outer_claims)
                .map(|c| c.sub.clone())
                .filter(|sub| !sub.is_empty())
                .unwrap_or_else(|| ANONYMOUS.to_string());

            let event = AuditEvent::new(event_type, subject, RPC_ACTION, resource, outcome);
            if let Err(e) = emitter.emit(&event).await {
                let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event_type,
                    dropped_total = total,
                    error = %e,
                    "audit event delivery failed"
                );
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{CallbackSink, EventMap, Sink, SinkError};
    use crate::authn::Claims;
    use crate::authz::attach_claims;
    use crate::middleware::error::RpcError;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::response::IntoResponse;
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use tower::util::BoxCloneSyncService;

    struct BrokenSink;

    #[async_trait]
    impl Sink for BrokenSink {
        async fn write(&self, _event: EventMap) -> Result<(), SinkError> {
            Err(SinkError::Delivery("collector unreachable".to_string()))
        }
        async fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn recording_emitter() -> (Arc<Emitter>, Arc<Mutex<Vec<EventMap>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            CallbackSink::new(move |e| seen.lock().push(e))
        };
        (Arc::new(Emitter::new(vec![Arc::new(sink)])), seen)
    }

    /// Authenticates as `sub` (when given), then answers with `response`.
    fn handler(sub: Option<&'static str>, code: Option<Code>) -> BoxCloneSyncService<Request, Response, Infallible> {
        BoxCloneSyncService::new(tower::service_fn(move |mut req: Request| async move {
            if let Some(sub) = sub {
                attach_claims(
                    &mut req,
                    Claims {
                        sub: sub.to_string(),
                        ..Default::default()
                    },
                );
            }
            let response = match code {
                Some(code) => RpcError::new(code, "rejected").into_response(),
                None => "OK".into_response(),
            };
            Ok::<Response, Infallible>(response)
        }))
    }

    fn request() -> Request {
        Request::builder().uri("/reports/Get").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_success_records_granted_with_inner_subject() {
        let (emitter, seen) = recording_emitter();
        let layer = AuditLayer::new(emitter, Arc::new(InterceptorConfig::default()));
        let mut service = tower::ServiceBuilder::new()
            .layer(layer)
            .service(handler(Some("svc-account"), None));

        let response = service.call(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "authz.granted");
        assert_eq!(events[0]["subject"], "svc-account");
        assert_eq!(events[0]["action"], "rpc");
        assert_eq!(events[0]["resource"], "/reports/Get");
        assert_eq!(events[0]["outcome"], "success");
    }

    #[tokio::test]
    async fn test_classification() {
        let cases = [
            (Some(Code::Unauthenticated), "auth.failure"),
            (Some(Code::PermissionDenied), "authz.denied"),
            (Some(Code::Internal), "authz.denied"),
        ];
        for (code, expected) in cases {
            let (emitter, seen) = recording_emitter();
            let layer = AuditLayer::new(emitter, Arc::new(InterceptorConfig::default()));
            let mut service = tower::ServiceBuilder::new().layer(layer).service(handler(None, code));

            service.call(request()).await.unwrap();
            let events = seen.lock();
            assert_eq!(events[0]["type"], expected, "{code:?}");
            assert_eq!(events[0]["outcome"], "failure");
            assert_eq!(events[0]["subject"], "anonymous");
        }
    }

    #[test]
    fn test_classify_plain_statuses() {
        let with_status = |status: StatusCode| -> Result<Response, Infallible> {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = status;
            Ok(response)
        };
        assert_eq!(classify(&with_status(StatusCode::UNAUTHORIZED)).0, EventType::AuthFailure);
        assert_eq!(classify(&with_status(StatusCode::FORBIDDEN)).0, EventType::AuthzDenied);
        assert_eq!(classify(&with_status(StatusCode::NOT_FOUND)).0, EventType::AuthzDenied);
        assert_eq!(classify(&with_status(StatusCode::NO_CONTENT)).0, EventType::AuthzGranted);
        assert_eq!(
            classify(&Err::<Response, &str>("boom")),
            (EventType::AuthzDenied, Outcome::Failure)
        );
    }

    #[tokio::test]
    async fn test_empty_subject_is_anonymous() {
        let (emitter, seen) = recording_emitter();
        let layer = AuditLayer::new(emitter, Arc::new(InterceptorConfig::default()));
        let mut service = tower::ServiceBuilder::new().layer(layer).service(handler(Some(""), None));

        service.call(request()).await.unwrap();
        assert_eq!(seen.lock()[0]["subject"], "anonymous");
    }

    #[tokio::test]
    async fn test_suppressed_types_are_not_emitted() {
        let (emitter, seen) = recording_emitter();
        let config = InterceptorConfig::builder()
            .skip_audit_types([EventType::AuthzGranted])
            .build();
        let mut service = tower::ServiceBuilder::new()
            .layer(AuditLayer::new(emitter, Arc::new(config)))
            .service(handler(Some("user-1"), None));

        service.call(request()).await.unwrap();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_change_result() {
        let emitter = Arc::new(Emitter::new(vec![Arc::new(BrokenSink)]));
        let layer = AuditLayer::new(emitter, Arc::new(InterceptorConfig::default()));
        let mut service = tower::ServiceBuilder::new()
            .layer(layer.clone())
            .service(handler(Some("user-1"), None));

        let response = service.call(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        service.call(request()).await.unwrap();
        assert_eq!(layer.dropped_events(), 2);
    }
}
