//! Authentication: token issuance, token verification and peer certificates

pub mod provider;
pub mod relying_party;
pub mod spiffe;
pub mod types;

pub use provider::{discovery_handler, OidcProvider, ProviderMetadata};
pub use relying_party::{
    generate_code_challenge, generate_code_verifier, generate_state, OidcRelyingParty, TokenValidator,
};
pub use spiffe::SpiffeAuthenticator;
pub use types::{Claims, ClaimsError, OidcProviderConfig, OidcRpConfig, SpiffeConfig, TokenSet};
