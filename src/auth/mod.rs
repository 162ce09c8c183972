//! Proxy authentication: challenge parsing and credential handling.

pub mod challenge;
pub mod handler;

pub use challenge::{
    parse_authentication_or_authorization_header, parse_challenges, ChallengeHolder,
    DigestChallenge, SharedChallengeHolder,
};
pub use handler::{AuthorizationChallengeHandler, CredentialHandler};

use serde::{Deserialize, Serialize};
use std::fmt;

pub const BASIC: &str = "Basic";
pub const DIGEST: &str = "Digest";

/// Scheme carried by the last CONNECT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    #[default]
    None,
    Basic,
    Digest,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::None => "none",
            AuthScheme::Basic => "basic",
            AuthScheme::Digest => "digest",
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
