//! Publishing the public key set.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use super::keystore::KeyStore;
use crate::error::Result;

/// `Cache-Control` value served with the key set.
pub const JWKS_CACHE_CONTROL: &str = "public, max-age=3600";

/// Serialize the store's public key set as JSON.
pub fn jwks_bytes(store: &dyn KeyStore) -> Result<Vec<u8>> {
    let set = store.key_set()?;
    Ok(serde_json::to_vec(&*set)?)
}

/// HTTP response carrying the store's public key set.
pub fn jwks_response(store: &dyn KeyStore) -> Response {
    match jwks_bytes(store) {
        Ok(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CACHE_CONTROL, JWKS_CACHE_CONTROL),
            ],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize key set");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to serialize key set").into_response()
        }
    }
}

/// Axum handler serving the key set of the store in state.
pub async fn jwks_handler(State(store): State<Arc<dyn KeyStore>>) -> Response {
    jwks_response(store.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MemoryKeyStore, SigningAlgorithm};
    use axum::body::to_bytes;
    use jsonwebtoken::jwk::JwkSet;

    #[tokio::test]
    async fn test_jwks_handler_headers_and_body() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new(SigningAlgorithm::ES256).unwrap());
        let kid = store.signing_key().unwrap().kid().to_string();

        let response = jwks_handler(State(store)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[header::CACHE_CONTROL], JWKS_CACHE_CONTROL);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let set: JwkSet = serde_json::from_slice(&body).unwrap();
        assert_eq!(set.keys.len(), 1);
        assert_eq!(set.find(&kid).map(|k| k.common.key_id.clone()), Some(Some(kid)));
    }
}
