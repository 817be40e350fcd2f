//! Signing key management.
//!
//! A key store owns exactly one current private key and publishes a JWK set
//! holding only the matching public key. Both live in a single [`KeyState`]
//! behind one lock, so readers always see a signing key and a key set from
//! the same generation; rotation builds the next state completely before the
//! swap and leaves the previous one untouched on any failure.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse, RSAKeyParameters, RSAKeyType,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use parking_lot::RwLock;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{AaaError, Result};

const RSA_KEY_BITS: usize = 2048;

/// Algorithm a key store generates keys for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// 2048-bit RSA with SHA-256
    RS256,
    /// P-256 ECDSA with SHA-256
    ES256,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::RS256 => "RS256",
            SigningAlgorithm::ES256 => "ES256",
        }
    }

    /// The matching `jsonwebtoken` algorithm.
    pub fn jwt_algorithm(&self) -> Algorithm {
        match self {
            SigningAlgorithm::RS256 => Algorithm::RS256,
            SigningAlgorithm::ES256 => Algorithm::ES256,
        }
    }

    fn key_algorithm(&self) -> KeyAlgorithm {
        match self {
            SigningAlgorithm::RS256 => KeyAlgorithm::RS256,
            SigningAlgorithm::ES256 => KeyAlgorithm::ES256,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = AaaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RS256" => Ok(SigningAlgorithm::RS256),
            "ES256" => Ok(SigningAlgorithm::ES256),
            other => Err(AaaError::Config(format!(
                "unsupported signing algorithm {other:?}; must be RS256 or ES256"
            ))),
        }
    }
}

enum PrivateKey {
    Rsa(Box<RsaPrivateKey>),
    Ec(p256::SecretKey),
}

/// A private signing key together with its derived public JWK.
pub struct SigningKey {
    kid: String,
    algorithm: SigningAlgorithm,
    private: PrivateKey,
    encoding: EncodingKey,
    public: Jwk,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Generate a fresh key pair for `algorithm`.
    pub fn generate(algorithm: SigningAlgorithm) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private = match algorithm {
            SigningAlgorithm::RS256 => {
                let key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
                    .map_err(|e| AaaError::KeyStore(format!("RSA key generation failed: {e}")))?;
                PrivateKey::Rsa(Box::new(key))
            }
            SigningAlgorithm::ES256 => PrivateKey::Ec(p256::SecretKey::random(&mut rng)),
        };
        Self::from_private(algorithm, private)
    }

    /// Load a PKCS#8 PEM private key, re-deriving its public half.
    pub fn from_pkcs8_pem(algorithm: SigningAlgorithm, pem: &str) -> Result<Self> {
        let private = match algorithm {
            SigningAlgorithm::RS256 => {
                let key = <RsaPrivateKey as rsa::pkcs8::DecodePrivateKey>::from_pkcs8_pem(pem)
                    .map_err(|e| AaaError::KeyStore(format!("failed to parse RSA private key: {e}")))?;
                PrivateKey::Rsa(Box::new(key))
            }
            SigningAlgorithm::ES256 => {
                let key = <p256::SecretKey as p256::pkcs8::DecodePrivateKey>::from_pkcs8_pem(pem)
                    .map_err(|e| AaaError::KeyStore(format!("failed to parse EC private key: {e}")))?;
                PrivateKey::Ec(key)
            }
        };
        Self::from_private(algorithm, private)
    }

    /// Serialize the private key as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> Result<String> {
        let pem = match &self.private {
            PrivateKey::Rsa(key) => rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(key.as_ref(), rsa::pkcs8::LineEnding::LF)
                .map_err(|e| AaaError::KeyStore(format!("failed to encode RSA private key: {e}")))?,
            PrivateKey::Ec(key) => p256::pkcs8::EncodePrivateKey::to_pkcs8_pem(key, p256::pkcs8::LineEnding::LF)
                .map_err(|e| AaaError::KeyStore(format!("failed to encode EC private key: {e}")))?,
        };
        Ok(pem.to_string())
    }

    fn from_private(algorithm: SigningAlgorithm, private: PrivateKey) -> Result<Self> {
        let (params, thumbprint_input, encoding) = match &private {
            PrivateKey::Rsa(key) => {
                let n = URL_SAFE_NO_PAD.encode(key.n().to_bytes_be());
                let e = URL_SAFE_NO_PAD.encode(key.e().to_bytes_be());
                let der = rsa::pkcs1::EncodeRsaPrivateKey::to_pkcs1_der(key.as_ref())
                    .map_err(|e| AaaError::KeyStore(format!("failed to encode RSA private key: {e}")))?;
                let encoding = EncodingKey::from_rsa_der(der.as_bytes());
                // RFC 7638 member order: e, kty, n
                let input = format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#);
                let params = AlgorithmParameters::RSA(RSAKeyParameters {
                    key_type: RSAKeyType::RSA,
                    n,
                    e,
                });
                (params, input, encoding)
            }
            PrivateKey::Ec(key) => {
                let point = key.public_key().to_encoded_point(false);
                let (x, y) = match (point.x(), point.y()) {
                    (Some(x), Some(y)) => (URL_SAFE_NO_PAD.encode(x), URL_SAFE_NO_PAD.encode(y)),
                    _ => return Err(AaaError::KeyStore("EC public key has no affine coordinates".to_string())),
                };
                let der = p256::pkcs8::EncodePrivateKey::to_pkcs8_der(key)
                    .map_err(|e| AaaError::KeyStore(format!("failed to encode EC private key: {e}")))?;
                let encoding = EncodingKey::from_ec_der(der.as_bytes());
                // RFC 7638 member order: crv, kty, x, y
                let input = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
                let params = AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                    key_type: EllipticCurveKeyType::EC,
                    curve: EllipticCurve::P256,
                    x,
                    y,
                });
                (params, input, encoding)
            }
        };

        let kid = URL_SAFE_NO_PAD.encode(Sha256::digest(thumbprint_input.as_bytes()));
        let public = Jwk {
            common: CommonParameters {
                public_key_use: Some(PublicKeyUse::Signature),
                key_algorithm: Some(algorithm.key_algorithm()),
                key_id: Some(kid.clone()),
                ..Default::default()
            },
            algorithm: params,
        };

        Ok(Self {
            kid,
            algorithm,
            private,
            encoding,
            public,
        })
    }

    /// Key identifier (RFC 7638 thumbprint of the public key).
    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    /// Public half as a JWK.
    pub fn public_jwk(&self) -> &Jwk {
        &self.public
    }

    /// Verification key for tokens signed by this key.
    pub fn decoding_key(&self) -> Result<DecodingKey> {
        DecodingKey::from_jwk(&self.public)
            .map_err(|e| AaaError::KeyStore(format!("failed to derive decoding key: {e}")))
    }
}

/// One generation of key material.
#[derive(Debug)]
struct KeyState {
    signing: Arc<SigningKey>,
    key_set: Arc<JwkSet>,
}

impl KeyState {
    fn new(signing: SigningKey) -> Self {
        let key_set = JwkSet {
            keys: vec![signing.public_jwk().clone()],
        };
        Self {
            signing: Arc::new(signing),
            key_set: Arc::new(key_set),
        }
    }
}

/// Manages the keys used to sign and verify tokens.
pub trait KeyStore: Send + Sync {
    /// Current private signing key.
    fn signing_key(&self) -> Result<Arc<SigningKey>>;

    /// Public key set for token verification.
    fn key_set(&self) -> Result<Arc<JwkSet>>;

    /// Replace the signing key and key set with a freshly generated pair.
    ///
    /// Blocks readers for the duration of the swap (and, for persistent
    /// stores, the write to disk). Do not call from a request handler.
    fn rotate_key(&self) -> Result<()>;

    /// Algorithm keys are generated for.
    fn algorithm(&self) -> SigningAlgorithm;
}

/// In-memory key store; keys are lost on restart.
#[derive(Debug)]
pub struct MemoryKeyStore {
    algorithm: SigningAlgorithm,
    state: RwLock<Arc<KeyState>>,
}

impl MemoryKeyStore {
    /// Create a store and generate its initial key.
    pub fn new(algorithm: SigningAlgorithm) -> Result<Self> {
        let key = SigningKey::generate(algorithm)
            .map_err(|e| AaaError::KeyStore(format!("memory_keystore: failed to generate initial key: {e}")))?;
        Ok(Self {
            algorithm,
            state: RwLock::new(Arc::new(KeyState::new(key))),
        })
    }
}

impl KeyStore for MemoryKeyStore {
    fn signing_key(&self) -> Result<Arc<SigningKey>> {
        Ok(self.state.read().signing.clone())
    }

    fn key_set(&self) -> Result<Arc<JwkSet>> {
        let state = self.state.read();
        if state.key_set.keys.is_empty() {
            return Err(AaaError::KeyStore("memory_keystore: no key set available".to_string()));
        }
        Ok(state.key_set.clone())
    }

    fn rotate_key(&self) -> Result<()> {
        let next = KeyState::new(SigningKey::generate(self.algorithm)?);
        let kid = next.signing.kid().to_string();
        *self.state.write() = Arc::new(next);
        tracing::debug!(kid = %kid, "rotated in-memory signing key");
        Ok(())
    }

    fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }
}

/// On-disk representation of a file-backed store.
#[derive(Serialize, Deserialize)]
struct StoredKey {
    algorithm: SigningAlgorithm,
    private_key: String,
}

/// Disk-backed key store.
///
/// The private key is written to `path` on creation (when the file does not
/// exist yet) and after every rotation. Rotation persists the new key before
/// it becomes visible, so a crash mid-rotation leaves the previous key both
/// on disk and, on restart, in memory.
#[derive(Debug)]
pub struct FileKeyStore {
    algorithm: SigningAlgorithm,
    path: PathBuf,
    state: RwLock<Arc<KeyState>>,
}

impl FileKeyStore {
    /// Load the key at `path`, or generate and save one when the file does not exist.
    pub fn new(algorithm: SigningAlgorithm, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let signing = match load_key(&path)? {
            Some(stored) => {
                if stored.algorithm != algorithm {
                    return Err(AaaError::Config(format!(
                        "file_keystore: {} holds a {} key but {} was requested",
                        path.display(),
                        stored.algorithm,
                        algorithm
                    )));
                }
                tracing::debug!(path = %path.display(), "loaded signing key from disk");
                SigningKey::from_pkcs8_pem(stored.algorithm, &stored.private_key)?
            }
            None => {
                let key = SigningKey::generate(algorithm)?;
                save_key(&path, &key).map_err(|e| {
                    AaaError::KeyStore(format!(
                        "file_keystore: failed to save initial key to {}: {e}",
                        path.display()
                    ))
                })?;
                tracing::debug!(path = %path.display(), "generated and saved new signing key");
                key
            }
        };

        Ok(Self {
            algorithm,
            path,
            state: RwLock::new(Arc::new(KeyState::new(signing))),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn signing_key(&self) -> Result<Arc<SigningKey>> {
        Ok(self.state.read().signing.clone())
    }

    fn key_set(&self) -> Result<Arc<JwkSet>> {
        let state = self.state.read();
        if state.key_set.keys.is_empty() {
            return Err(AaaError::KeyStore("file_keystore: no key set available".to_string()));
        }
        Ok(state.key_set.clone())
    }

    fn rotate_key(&self) -> Result<()> {
        let next = KeyState::new(SigningKey::generate(self.algorithm)?);

        let mut state = self.state.write();
        save_key(&self.path, &next.signing)?;
        tracing::debug!(kid = %next.signing.kid(), path = %self.path.display(), "rotated file-backed signing key");
        *state = Arc::new(next);
        Ok(())
    }

    fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }
}

fn load_key(path: &Path) -> Result<Option<StoredKey>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AaaError::KeyStore(format!(
                "file_keystore: failed to read {}: {e}",
                path.display()
            )))
        }
    };
    let stored: StoredKey = serde_json::from_slice(&data).map_err(|e| {
        AaaError::KeyStore(format!("file_keystore: malformed key file {}: {e}", path.display()))
    })?;
    Ok(Some(stored))
}

/// Write through a temporary file and rename so a torn write never replaces the old key.
fn save_key(path: &Path, key: &SigningKey) -> Result<()> {
    let stored = StoredKey {
        algorithm: key.algorithm(),
        private_key: key.to_pkcs8_pem()?,
    };
    let data = serde_json::to_vec_pretty(&stored)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    write_private(&tmp, &data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
