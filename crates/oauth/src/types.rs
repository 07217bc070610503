use std::fmt;

use {
    secrecy::SecretString,
    serde::{Deserialize, Serialize},
    url::Url,
};

/// Seconds shaved off `expires_in` so a token is not used right at its edge.
pub const EXPIRY_SKEW_SECS: u64 = 60;

/// OAuth 2.0 client configuration for the authorization code + PKCE flow.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub auth_url: String,
    pub token_url: String,
    /// Ordered allow-list mapping the current location to a redirect URI.
    pub redirect_rules: Vec<RedirectRule>,
    pub scopes: Vec<String>,
    /// Requested verifier length, clamped to `1..=128`.
    pub verifier_length: usize,
    /// Treat records past `obtained_at + expires_in` as absent.
    pub check_expiry: bool,
}

/// One allow-listed redirect URI, selected when the location's host contains
/// `host_contains`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
    pub host_contains: String,
    pub redirect_uri: Url,
}

/// Token endpoint response, persisted as-is under the `authResponse` key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    /// Lifetime in seconds, as reported by the token endpoint.
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String,
    /// Unix timestamp at which the record was obtained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obtained_at: Option<u64>,
}

impl TokenRecord {
    /// Unix timestamp after which the token should no longer be used, if known.
    pub fn expires_at(&self) -> Option<u64> {
        if self.expires_in == 0 {
            return None;
        }
        self.obtained_at
            .map(|at| at + self.expires_in.saturating_sub(EXPIRY_SKEW_SECS))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scope", &self.scope)
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// PKCE challenge pair.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: SecretString,
    pub challenge: String,
}

/// Progress of the authorization flow for the current page load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    AwaitingRedirectBack,
    ExchangingCode,
    Authenticated,
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
