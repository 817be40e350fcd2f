//! Configuration file loading
//!
//! Every section is optional; a service takes the sections for the
//! components it runs and converts them into the component configs, which
//! apply their own validation and defaults. Durations are whole seconds.
//!
//! # Example
//!
//! ```rust,ignore
//! use penguin_aaa::config::load_config;
//!
//! let config = load_config("aaa.toml")?;
//! let rp = OidcRelyingParty::discover(config.relying_party_config()?.to_rp_config()?).await?;
//! let pipeline = AaaPipeline::new(config.interceptor_config()?)
//!     .bearer(Arc::new(rp))
//!     .audit(Arc::new(config.audit_config()?.build_emitter().await?));
//! ```

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{
    BatchingHttpSink, BatchingSinkConfig, Emitter, EventType, FileSink, Sink, StdoutSink, SyslogSink, TracingSink,
};
use crate::authn::{OidcProviderConfig, OidcRpConfig, SpiffeConfig};
use crate::crypto::{FileKeyStore, KeyStore, MemoryKeyStore, SigningAlgorithm};
use crate::middleware::InterceptorConfig;
use crate::{AaaError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AaaConfig {
    /// Token issuer section
    #[serde(default)]
    pub provider: Option<ProviderSection>,

    /// Token verifier section
    #[serde(default)]
    pub relying_party: Option<RelyingPartySection>,

    /// Peer-certificate authentication section
    #[serde(default)]
    pub spiffe: Option<SpiffeSection>,

    /// Audit sinks section
    #[serde(default)]
    pub audit: Option<AuditSection>,

    /// Interceptor options
    #[serde(default)]
    pub interceptors: Option<InterceptorSection>,
}

impl AaaConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_config(path)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AaaError::Config(format!("Failed to parse TOML config: {}", e)))
    }

    pub fn provider_config(&self) -> Result<&ProviderSection> {
        self.provider
            .as_ref()
            .ok_or_else(|| missing_section("provider"))
    }

    pub fn relying_party_config(&self) -> Result<&RelyingPartySection> {
        self.relying_party
            .as_ref()
            .ok_or_else(|| missing_section("relying_party"))
    }

    pub fn spiffe_config(&self) -> Result<&SpiffeSection> {
        self.spiffe.as_ref().ok_or_else(|| missing_section("spiffe"))
    }

    pub fn audit_config(&self) -> Result<&AuditSection> {
        self.audit.as_ref().ok_or_else(|| missing_section("audit"))
    }

    /// Interceptor options; an absent section yields the empty configuration.
    pub fn interceptor_config(&self) -> Result<InterceptorConfig> {
        self.interceptors
            .as_ref()
            .map(InterceptorSection::to_interceptor_config)
            .unwrap_or_else(|| Ok(InterceptorConfig::default()))
    }
}

fn missing_section(name: &str) -> AaaError {
    AaaError::Config(format!("[{name}] section not found in config file"))
}

/// `[provider]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    /// HTTPS URL identifying this provider
    pub issuer: String,

    /// Audiences issued tokens are intended for
    pub audiences: Vec<String>,

    /// `RS256` (default) or `ES256`
    #[serde(default)]
    pub algorithm: Option<String>,

    #[serde(default)]
    pub token_ttl_secs: Option<u64>,

    #[serde(default)]
    pub refresh_ttl_secs: Option<u64>,

    /// Persist the signing key here; keys live in memory only when unset
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl ProviderSection {
    fn algorithm(&self) -> Result<SigningAlgorithm> {
        self.algorithm
            .as_deref()
            .map(str::parse::<SigningAlgorithm>)
            .unwrap_or(Ok(SigningAlgorithm::RS256))
    }

    pub fn to_provider_config(&self) -> Result<OidcProviderConfig> {
        Ok(OidcProviderConfig {
            issuer: self.issuer.clone(),
            audiences: self.audiences.clone(),
            algorithm: self.algorithm()?,
            token_ttl: secs(self.token_ttl_secs),
            refresh_ttl: secs(self.refresh_ttl_secs),
        })
    }

    /// Key store for the configured algorithm: file-backed when `key_file` is set.
    pub fn key_store(&self) -> Result<Arc<dyn KeyStore>> {
        let algorithm = self.algorithm()?;
        Ok(match &self.key_file {
            Some(path) => Arc::new(FileKeyStore::new(algorithm, path)?),
            None => Arc::new(MemoryKeyStore::new(algorithm)?),
        })
    }
}

/// `[relying_party]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelyingPartySection {
    /// OIDC provider issuer URL
    pub issuer_url: String,

    /// Client ID
    pub client_id: String,

    /// Client secret (optional for public clients)
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Redirect URL (for authorization code flow)
    #[serde(default)]
    pub redirect_url: Option<String>,

    /// Scopes to request (default: `["openid"]`)
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Accepted signing algorithms by JOSE name
    #[serde(default)]
    pub algorithms: Vec<String>,

    #[serde(default)]
    pub clock_skew_secs: Option<u64>,
}

impl RelyingPartySection {
    pub fn to_rp_config(&self) -> Result<OidcRpConfig> {
        let algorithms = self
            .algorithms
            .iter()
            .map(|alg| {
                alg.parse::<Algorithm>()
                    .map_err(|_| AaaError::Config(format!("relying_party: unknown algorithm {alg:?}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(OidcRpConfig {
            issuer_url: self.issuer_url.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_url: self.redirect_url.clone().unwrap_or_default(),
            scopes: self.scopes.clone(),
            algorithms,
            clock_skew: secs(self.clock_skew_secs),
        })
    }
}

/// `[spiffe]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiffeSection {
    pub trust_domain: String,
    pub workload_socket: String,
    pub allowed_ids: Vec<String>,
}

impl SpiffeSection {
    pub fn to_spiffe_config(&self) -> SpiffeConfig {
        SpiffeConfig {
            trust_domain: self.trust_domain.clone(),
            workload_socket: self.workload_socket.clone(),
            allowed_ids: self.allowed_ids.clone(),
        }
    }
}

/// One entry of `[[audit.sinks]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSection {
    Stdout,
    Tracing,
    File {
        path: PathBuf,
        /// Rotate once the file reaches this size (default 100)
        #[serde(default)]
        max_size_mb: Option<u64>,
    },
    Syslog {
        /// `host:port` of a UDP syslog receiver
        address: String,
    },
}

const DEFAULT_FILE_SINK_MB: u64 = 100;

/// `[audit]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSection {
    #[serde(default)]
    pub sinks: Vec<SinkSection>,

    /// Batching HTTP delivery, in addition to `sinks`
    #[serde(default)]
    pub batching: Option<BatchingSection>,
}

impl AuditSection {
    /// Open every configured sink and wrap them in an [`Emitter`].
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn build_emitter(&self) -> Result<Emitter> {
        let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(self.sinks.len() + 1);
        for section in &self.sinks {
            let sink: Arc<dyn Sink> = match section {
                SinkSection::Stdout => Arc::new(StdoutSink::new()),
                SinkSection::Tracing => Arc::new(TracingSink),
                SinkSection::File { path, max_size_mb } => Arc::new(
                    FileSink::new(path, max_size_mb.unwrap_or(DEFAULT_FILE_SINK_MB))
                        .await
                        .map_err(|e| AaaError::Config(format!("audit: file sink {}: {e}", path.display())))?,
                ),
                SinkSection::Syslog { address } => Arc::new(
                    SyslogSink::connect(address)
                        .await
                        .map_err(|e| AaaError::Config(format!("audit: syslog sink {address}: {e}")))?,
                ),
            };
            sinks.push(sink);
        }
        if let Some(batching) = &self.batching {
            sinks.push(Arc::new(BatchingHttpSink::new(batching.to_batching_config())?));
        }
        tracing::debug!(sinks = sinks.len(), "audit emitter configured");
        Ok(Emitter::new(sinks))
    }
}

/// `[audit.batching]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingSection {
    pub endpoint: String,
    pub api_key: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub flush_interval_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl BatchingSection {
    pub fn to_batching_config(&self) -> BatchingSinkConfig {
        BatchingSinkConfig {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            batch_size: self.batch_size.unwrap_or_default(),
            flush_interval: secs(self.flush_interval_secs),
            timeout: secs(self.timeout_secs),
            max_retries: self.max_retries.unwrap_or_default(),
        }
    }
}

/// `[interceptors]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterceptorSection {
    /// Procedures exempt from authentication, authorization and tenant checks
    #[serde(default)]
    pub public_procedures: Vec<String>,

    /// Audit event types not to emit, e.g. `"authz.granted"`
    #[serde(default)]
    pub skip_audit_types: Vec<String>,
}

impl InterceptorSection {
    pub fn to_interceptor_config(&self) -> Result<InterceptorConfig> {
        let skip = self
            .skip_audit_types
            .iter()
            .map(|t| t.parse::<EventType>())
            .collect::<Result<Vec<_>>>()?;
        Ok(InterceptorConfig::builder()
            .public_procedures(self.public_procedures.iter().cloned())
            .skip_audit_types(skip)
            .build())
    }
}

/// Zero (the component default) when unset.
fn secs(value: Option<u64>) -> Duration {
    Duration::from_secs(value.unwrap_or_default())
}

/// Load configuration from a TOML file
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Example
///
/// ```rust,ignore
/// let config = penguin_aaa::config::load_config("aaa.toml")?;
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AaaConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| AaaError::Config(format!("Failed to read config file: {}", e)))?;

    AaaConfig::from_toml_str(&content)
}
