use thiserror::Error;

/// Errors surfaced by the authorization flow and token store.
///
/// Variants carry rendered messages rather than source errors so that a single
/// in-flight code exchange can hand the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The current location matches none of the allow-listed redirect URIs.
    #[error("configuration: no redirect URI registered for location {location}")]
    Config { location: String },

    /// A code arrived but no PKCE verifier was stored for it.
    #[error("exchange: code verifier is missing from storage, restart authorization")]
    MissingVerifier,

    /// The authorization server redirected back with `error=<reason>`.
    #[error("authorization denied: {0}")]
    Denied(String),

    /// The browser was sent to the authorization server; the redirect back has
    /// not been received yet.
    #[error("authorization pending: waiting for the redirect back from the authorization server")]
    AuthorizationPending,

    /// The token endpoint rejected the code or could not be reached.
    #[error("exchange: {}", exchange_detail(.status, .message))]
    Exchange {
        status: Option<u16>,
        message: String,
    },

    /// Durable storage could not be read or written.
    #[error("storage: {0}")]
    Storage(String),

    /// The navigator could not open the authorization URL.
    #[error("navigation: {0}")]
    Navigation(String),
}

impl AuthError {
    /// Whether the caller should restart the flow with `begin_authorization`.
    pub fn needs_reauthorization(&self) -> bool {
        matches!(self, Self::MissingVerifier | Self::Exchange { .. })
    }
}

fn exchange_detail(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("token endpoint returned HTTP {code}: {message}"),
        None => format!("token request failed: {message}"),
    }
}

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_message_names_status() {
        let err = AuthError::Exchange {
            status: Some(400),
            message: "invalid_grant".into(),
        };
        assert_eq!(
            err.to_string(),
            "exchange: token endpoint returned HTTP 400: invalid_grant"
        );

        let err = AuthError::Exchange {
            status: None,
            message: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "exchange: token request failed: connection refused"
        );
    }

    #[test]
    fn test_config_error_is_not_reauthorizable() {
        let err = AuthError::Config {
            location: "http://example.com/".into(),
        };
        assert!(!err.needs_reauthorization());
        assert!(AuthError::MissingVerifier.needs_reauthorization());
    }
}
