//! The full interceptor stack in front of an axum router, driven with tokens
//! issued by a real provider and with minted SPIFFE certificates.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use penguin_aaa::audit::{CallbackSink, EventMap, FileSink};
use penguin_aaa::axum_integration::ClaimsExtractor;
use penguin_aaa::middleware::PeerCertificates;
use penguin_aaa::{
    AaaPipeline, Claims, Emitter, EventType, InterceptorConfig, KeyStore, MemoryKeyStore, OidcProvider,
    OidcProviderConfig, OidcRelyingParty, OidcRpConfig, ProcedureScopes, RbacEnforcer, Role, SigningAlgorithm,
    SpiffeAuthenticator, SpiffeConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const ISSUER: &str = "https://auth.example.com";
const AUDIENCE: &str = "reports-api";

struct Fixture {
    provider: OidcProvider,
    relying_party: Arc<OidcRelyingParty>,
}

fn fixture() -> Fixture {
    let keys: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new(SigningAlgorithm::ES256).unwrap());
    let provider = OidcProvider::new(
        OidcProviderConfig {
            issuer: ISSUER.to_string(),
            audiences: vec![AUDIENCE.to_string()],
            algorithm: SigningAlgorithm::ES256,
            ..Default::default()
        },
        keys.clone(),
    )
    .unwrap();
    let relying_party = OidcRelyingParty::from_parts(
        OidcRpConfig {
            issuer_url: ISSUER.to_string(),
            client_id: AUDIENCE.to_string(),
            ..Default::default()
        },
        provider.discovery_document().unwrap(),
        (*keys.key_set().unwrap()).clone(),
    )
    .unwrap();
    Fixture {
        provider,
        relying_party: Arc::new(relying_party),
    }
}

fn token(f: &Fixture, sub: &str, scope: &[&str], roles: &[&str], tenant: &str) -> String {
    let mut claims = Claims::new(sub, ISSUER, vec![AUDIENCE.to_string()], Duration::from_secs(300));
    claims.scope = scope.iter().map(|s| s.to_string()).collect();
    claims.roles = roles.iter().map(|s| s.to_string()).collect();
    claims.tenant = tenant.to_string();
    f.provider.issue_token_set(&claims).unwrap().access_token
}

fn recorder() -> (Arc<Emitter>, Arc<Mutex<Vec<EventMap>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = seen.clone();
        CallbackSink::new(move |e| seen.lock().push(e))
    };
    (Arc::new(Emitter::new(vec![Arc::new(sink)])), seen)
}

async fn get_report(claims: ClaimsExtractor) -> String {
    format!("report for {} in {}", claims.sub, claims.tenant)
}

fn app(pipeline: AaaPipeline) -> Router {
    Router::new()
        .route("/reports.v1.Reports/Get", post(get_report))
        .route("/reports.v1.Reports/Write", post(get_report))
        .route("/grpc.health.v1.Health/Check", post(|| async { "SERVING" }))
        .layer(pipeline)
}

fn bearer_pipeline(f: &Fixture, emitter: Arc<Emitter>, config: InterceptorConfig) -> AaaPipeline {
    let enforcer = RbacEnforcer::new([
        Role::new("editor", ["report:read", "report:write"]),
        Role::new("viewer", ["report:read"]),
    ]);
    let procedures = ProcedureScopes::new()
        .require("/reports.v1.Reports/Get", ["report:read"])
        .require("/reports.v1.Reports/Write", ["report:write"]);
    AaaPipeline::new(config)
        .bearer(f.relying_party.clone())
        .authorize(Arc::new(enforcer), procedures)
        .require_tenant()
        .audit(emitter)
}

fn default_config() -> InterceptorConfig {
    InterceptorConfig::builder()
        .public_procedures(["/grpc.health.v1.Health/Check"])
        .build()
}

fn rpc(path: &str, token: Option<&str>) -> Request {
    let mut builder = Request::builder().method(Method::POST).uri(path);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_missing_token_is_unauthenticated_and_audited_as_anonymous() {
    let f = fixture();
    let (emitter, seen) = recorder();
    let app = app(bearer_pipeline(&f, emitter, default_config()));

    let response = app.oneshot(rpc("/reports.v1.Reports/Get", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], "unauthenticated");

    let events = seen.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "auth.failure");
    assert_eq!(events[0]["subject"], "anonymous");
    assert_eq!(events[0]["resource"], "/reports.v1.Reports/Get");
}

#[tokio::test]
async fn test_valid_token_with_scope_succeeds() {
    let f = fixture();
    let (emitter, seen) = recorder();
    let app = app(bearer_pipeline(&f, emitter, default_config()));
    let token = token(&f, "svc-account", &["report:read"], &[], "acme");

    let response = app.oneshot(rpc("/reports.v1.Reports/Get", Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "report for svc-account in acme");

    let events = seen.lock();
    assert_eq!(events[0]["type"], "authz.granted");
    assert_eq!(events[0]["subject"], "svc-account");
    assert_eq!(events[0]["outcome"], "success");
}

#[tokio::test]
async fn test_insufficient_scope_is_permission_denied() {
    let f = fixture();
    let (emitter, seen) = recorder();
    let app = app(bearer_pipeline(&f, emitter, default_config()));
    let token = token(&f, "svc-account", &["report:read"], &[], "acme");

    let response = app.oneshot(rpc("/reports.v1.Reports/Write", Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let events = seen.lock();
    assert_eq!(events[0]["type"], "authz.denied");
    assert_eq!(events[0]["subject"], "svc-account");
    assert_eq!(events[0]["outcome"], "failure");
}

#[tokio::test]
async fn test_role_grants_scope() {
    let f = fixture();
    let (emitter, _seen) = recorder();
    let app = app(bearer_pipeline(&f, emitter, default_config()));
    let token = token(&f, "editor-1", &[], &["editor"], "acme");

    let response = app.oneshot(rpc("/reports.v1.Reports/Write", Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_tenant_is_permission_denied() {
    let f = fixture();
    let (emitter, seen) = recorder();
    let app = app(bearer_pipeline(&f, emitter, default_config()));
    let token = token(&f, "svc-account", &["report:read"], &[], "");

    let response = app.oneshot(rpc("/reports.v1.Reports/Get", Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_text(response).await.contains("missing tenant claim"));
    assert_eq!(seen.lock()[0]["type"], "authz.denied");
}

#[tokio::test]
async fn test_tampered_token_is_unauthenticated() {
    let f = fixture();
    let (emitter, seen) = recorder();
    let app = app(bearer_pipeline(&f, emitter, default_config()));
    let mut token = token(&f, "svc-account", &["report:read"], &[], "acme");
    token.push('A');

    let response = app.oneshot(rpc("/reports.v1.Reports/Get", Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!body_text(response).await.contains(&token));
    assert_eq!(seen.lock()[0]["subject"], "anonymous");
}

#[tokio::test]
async fn test_public_procedure_and_suppressed_audit() {
    let f = fixture();
    let (emitter, seen) = recorder();
    let config = InterceptorConfig::builder()
        .public_procedures(["/grpc.health.v1.Health/Check"])
        .skip_audit_types([EventType::AuthzGranted])
        .build();
    let app = app(bearer_pipeline(&f, emitter, config));

    let response = app.clone().oneshot(rpc("/grpc.health.v1.Health/Check", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(seen.lock().is_empty());

    let response = app.oneshot(rpc("/reports.v1.Reports/Get", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_audit_to_file_sink() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.log");
    let sink = FileSink::new(&path, 1).await.unwrap();
    let emitter = Arc::new(Emitter::new(vec![Arc::new(sink)]));
    let app = app(bearer_pipeline(&f, emitter.clone(), default_config()));
    let token = token(&f, "svc-account", &["report:read"], &[], "acme");

    app.oneshot(rpc("/reports.v1.Reports/Get", Some(&token))).await.unwrap();
    emitter.close().await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(line["type"], "authz.granted");
    assert_eq!(line["subject"], "svc-account");
}

fn workload_certificate(uri: &str) -> Vec<u8> {
    let mut params = rcgen::CertificateParams::new(vec!["workload.local".to_string()]).unwrap();
    params
        .subject_alt_names
        .push(rcgen::SanType::URI(uri.to_string().try_into().unwrap()));
    let key = rcgen::KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().der().to_vec()
}

#[tokio::test]
async fn test_spiffe_pipeline() {
    let authenticator = SpiffeAuthenticator::new(SpiffeConfig {
        trust_domain: "example.org".to_string(),
        workload_socket: "unix:///run/spire/agent.sock".to_string(),
        allowed_ids: vec!["spiffe://example.org/billing".to_string()],
    })
    .unwrap();
    let (emitter, seen) = recorder();
    let pipeline = AaaPipeline::new(default_config())
        .spiffe(Arc::new(authenticator))
        .audit(emitter);
    let app = Router::new()
        .route("/billing.v1.Billing/Charge", post(|claims: ClaimsExtractor| async move { claims.sub.clone() }))
        .layer(pipeline);

    let mut req = rpc("/billing.v1.Billing/Charge", None);
    req.extensions_mut()
        .insert(PeerCertificates(vec![workload_certificate("spiffe://example.org/billing")]));
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "spiffe://example.org/billing");

    let mut req = rpc("/billing.v1.Billing/Charge", None);
    req.extensions_mut()
        .insert(PeerCertificates(vec![workload_certificate("spiffe://example.org/intruder")]));
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let events = seen.lock();
    assert_eq!(events[0]["subject"], "spiffe://example.org/billing");
    assert_eq!(events[1]["type"], "auth.failure");
    assert_eq!(events[1]["subject"], "anonymous");
}
