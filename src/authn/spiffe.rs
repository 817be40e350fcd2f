//! SPIFFE peer-certificate authentication.
//!
//! Identifies a workload by the `spiffe://` URI SAN of its X.509 leaf
//! certificate and accepts it only when that ID belongs to the configured
//! trust domain and is on the allow-list. Chain verification is the TLS layer's job; fetching SVIDs
//! from the workload API belongs to whoever terminates TLS, which can read
//! the socket path from [`SpiffeAuthenticator::workload_socket`].

use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::types::{Claims, SpiffeConfig};
use crate::error::{AaaError, Result};

/// Issuer recorded on claims synthesized from a peer certificate.
pub const SPIFFE_ISSUER: &str = "spiffe";

/// Validates peer certificates against allowed SPIFFE IDs.
#[derive(Debug, Clone)]
pub struct SpiffeAuthenticator {
    config: SpiffeConfig,
}

impl SpiffeAuthenticator {
    pub fn new(config: SpiffeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AaaError::Config(format!("spiffe: invalid config: {e}")))?;
        Ok(Self { config })
    }

    pub fn trust_domain(&self) -> &str {
        &self.config.trust_domain
    }

    /// Workload API socket for SVID retrieval.
    pub fn workload_socket(&self) -> &str {
        &self.config.workload_socket
    }

    /// Return the SPIFFE ID of the leaf certificate (first in `certs`, DER)
    /// when it is allowed.
    pub fn validate_peer_certificate<C: AsRef<[u8]>>(&self, certs: &[C]) -> Result<String> {
        let leaf = certs
            .first()
            .ok_or_else(|| AaaError::PeerCertificate("no peer certificates provided".to_string()))?;

        let peer_id = spiffe_id_from_der(leaf.as_ref())?;

        if trust_domain_of(&peer_id) != Some(self.config.trust_domain.as_str()) {
            return Err(AaaError::PeerCertificate(format!(
                "peer id {peer_id:?} is outside trust domain {:?}",
                self.config.trust_domain
            )));
        }

        if self.config.allowed_ids.iter().any(|allowed| allowed == &peer_id) {
            tracing::debug!(spiffe_id = %peer_id, "accepted peer certificate");
            Ok(peer_id)
        } else {
            Err(AaaError::PeerCertificate(format!(
                "peer id {peer_id:?} is not in the allowed set"
            )))
        }
    }

    /// Claims standing in for a token when a peer authenticates by certificate.
    ///
    /// These carry no audience or validity window and are not run through
    /// [`Claims::validate`].
    pub fn claims_for(spiffe_id: &str) -> Claims {
        Claims {
            sub: spiffe_id.to_string(),
            iss: SPIFFE_ISSUER.to_string(),
            ..Default::default()
        }
    }
}

/// Extract the SPIFFE ID from a DER certificate.
///
/// The certificate must carry exactly one URI SAN and it must be a
/// `spiffe://` URI.
pub fn spiffe_id_from_der(der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| AaaError::PeerCertificate(format!("failed to parse peer certificate: {e}")))?;

    let san = cert
        .subject_alternative_name()
        .map_err(|e| AaaError::PeerCertificate(format!("malformed subject alternative name: {e}")))?
        .ok_or_else(|| AaaError::PeerCertificate("peer certificate has no URI SAN".to_string()))?;

    let uris: Vec<&str> = san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::URI(uri) => Some(*uri),
            _ => None,
        })
        .collect();

    match uris.as_slice() {
        [id] if id.starts_with("spiffe://") => Ok(id.to_string()),
        [] => Err(AaaError::PeerCertificate("peer certificate has no URI SAN".to_string())),
        [other] => Err(AaaError::PeerCertificate(format!(
            "peer certificate URI SAN {other:?} is not a SPIFFE ID"
        ))),
        _ => Err(AaaError::PeerCertificate(format!(
            "peer certificate has {} URI SANs, expected exactly one SPIFFE ID",
            uris.len()
        ))),
    }
}

/// Trust domain of a `spiffe://` ID, e.g. `example.org` for
/// `spiffe://example.org/api`.
fn trust_domain_of(spiffe_id: &str) -> Option<&str> {
    let rest = spiffe_id.strip_prefix("spiffe://")?;
    let domain = rest.split('/').next().unwrap_or(rest);
    (!domain.is_empty()).then_some(domain)
}

#[cfg(test)]
pub(crate) fn test_certificate(uris: &[&str]) -> Vec<u8> {
    let mut params = rcgen::CertificateParams::new(vec!["workload.local".to_string()]).unwrap();
    for uri in uris {
        params
            .subject_alt_names
            .push(rcgen::SanType::URI(uri.to_string().try_into().unwrap()));
    }
    let key = rcgen::KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().der().to_vec()
}
