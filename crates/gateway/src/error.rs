use {deeptrack_oauth::AuthError, thiserror::Error};

/// Failures of an authenticated request, tagged with the stage that failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The API rejected the bearer token (401/403).
    #[error("fetch {url}: HTTP {status}, {}", unauthorized_detail(.reauthorizing))]
    Unauthorized {
        url: String,
        status: u16,
        reauthorizing: bool,
    },

    #[error("fetch {url}: HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("fetch {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("decode {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// An absolute URL outside the API origin; the token is never sent there.
    #[error("refusing to send credentials to {url}: not on the API host")]
    ForeignOrigin { url: String },
}

impl FetchError {
    /// Whether completing an authorization round trip could make a retry succeed.
    pub fn needs_login(&self) -> bool {
        match self {
            Self::Auth(e) => {
                matches!(e, AuthError::AuthorizationPending) || e.needs_reauthorization()
            },
            Self::Unauthorized { reauthorizing, .. } => *reauthorizing,
            _ => false,
        }
    }
}

fn unauthorized_detail(reauthorizing: &bool) -> &'static str {
    if *reauthorizing {
        "authorization restarted"
    } else {
        "token rejected"
    }
}
