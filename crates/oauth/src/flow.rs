//! Authorization code flow with PKCE, driven lazily by token requests.
//!
//! `current_token` walks the flow forward from whatever state the current
//! page load is in: a usable stored record is returned directly, a `code` in
//! the location is exchanged once (concurrent callers share that exchange),
//! and otherwise the browser is sent to the authorization server.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use {
    futures::future::{BoxFuture, FutureExt, Shared},
    secrecy::ExposeSecret,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    error::{AuthError, Result},
    redirect::resolve_redirect_uri,
    storage::TokenStore,
    types::{AuthState, OAuthConfig, PkceChallenge, TokenRecord, unix_now},
};

/// Sends the user agent to a URL, like a full-page navigation.
pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &Url) -> anyhow::Result<()>;
}

type PendingExchange = Shared<BoxFuture<'static, Result<TokenRecord>>>;

struct FlowInner {
    state: AuthState,
    location: Url,
    /// The `code`/`error` in `location` has already been acted upon.
    redirect_consumed: bool,
    pending: Option<PendingExchange>,
}

enum Step {
    Ready(String),
    Exchange(PendingExchange),
}

enum RedirectOutcome {
    Code(String),
    Denied(String),
}

pub struct OAuthFlow {
    config: OAuthConfig,
    store: Arc<TokenStore>,
    navigator: Arc<dyn Navigator>,
    client: reqwest::Client,
    inner: Mutex<FlowInner>,
}

impl OAuthFlow {
    pub fn new(
        config: OAuthConfig,
        store: Arc<TokenStore>,
        navigator: Arc<dyn Navigator>,
        location: Url,
    ) -> Self {
        Self::with_client(config, store, navigator, location, reqwest::Client::new())
    }

    pub fn with_client(
        config: OAuthConfig,
        store: Arc<TokenStore>,
        navigator: Arc<dyn Navigator>,
        location: Url,
        client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            store,
            navigator,
            client,
            inner: Mutex::new(FlowInner {
                state: AuthState::Unauthenticated,
                location,
                redirect_consumed: false,
                pending: None,
            }),
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn state(&self) -> AuthState {
        self.lock().state
    }

    pub fn location(&self) -> Url {
        self.lock().location.clone()
    }

    /// Treat `location` as a fresh page load, typically the redirect back.
    pub fn load(&self, location: Url) {
        let mut inner = self.lock();
        debug!(path = location.path(), "page load");
        inner.location = location;
        inner.redirect_consumed = false;
        if inner.pending.is_none() {
            inner.state = AuthState::Unauthenticated;
        }
    }

    /// The redirect URI registered for the current location.
    pub fn redirect_uri(&self) -> Result<Url> {
        let inner = self.lock();
        self.resolve_for(&inner.location)
    }

    /// Whether a usable token record is available without any network call.
    pub fn is_authenticated(&self) -> bool {
        self.usable_record().is_some()
    }

    /// Return the access token, driving the flow through any pending step.
    ///
    /// When the browser has to be sent to the authorization server this
    /// returns [`AuthError::AuthorizationPending`]; call [`OAuthFlow::load`]
    /// with the redirect-back URL and ask again.
    pub async fn current_token(&self) -> Result<String> {
        match self.next_step()? {
            Step::Ready(token) => Ok(token),
            Step::Exchange(pending) => self.finish_exchange(pending).await,
        }
    }

    /// Generate a verifier, persist it, and navigate to the authorize URL.
    pub fn begin_authorization(&self) -> Result<Url> {
        let mut inner = self.lock();
        self.authorize_locked(&mut inner)
    }

    /// Drop the current record and stop trusting the code in the location.
    pub fn invalidate(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.redirect_consumed = true;
        if inner.pending.is_none() {
            inner.state = AuthState::Unauthenticated;
        }
        info!("discarding current token record");
        self.store.clear()
    }

    /// Discard the current record and restart authorization.
    ///
    /// Concurrent callers hitting an invalid token navigate only once per
    /// round trip.
    pub fn reauthorize(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.redirect_consumed = true;
        self.store.clear()?;
        if inner.state == AuthState::AwaitingRedirectBack {
            debug!("authorization already in progress");
            return Ok(());
        }
        inner.state = AuthState::Unauthenticated;
        warn!("access token rejected, restarting authorization");
        self.authorize_locked(&mut inner).map(|_| ())
    }

    /// Build the authorize URL for `redirect_uri` and `challenge`.
    pub fn authorize_url(&self, redirect_uri: &Url, challenge: &str) -> Result<Url> {
        let scope = self.config.scopes.join(" ");
        Url::parse_with_params(&self.config.auth_url, [
            ("client_id", self.config.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", scope.as_str()),
            ("code_challenge_method", "S256"),
            ("code_challenge", challenge),
        ])
        .map_err(|e| {
            AuthError::Navigation(format!("invalid authorize URL {}: {e}", self.config.auth_url))
        })
    }

    fn lock(&self) -> MutexGuard<'_, FlowInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve_for(&self, location: &Url) -> Result<Url> {
        resolve_redirect_uri(location, &self.config.redirect_rules).ok_or_else(|| {
            AuthError::Config {
                location: location.to_string(),
            }
        })
    }

    fn usable_record(&self) -> Option<TokenRecord> {
        let record = self.store.get()?;
        if self.config.check_expiry && record.is_expired(unix_now()) {
            info!("stored access token has expired");
            if let Err(e) = self.store.clear() {
                warn!(%e, "failed to clear expired token record");
            }
            return None;
        }
        Some(record)
    }

    /// Decide the next step under one lock so concurrent callers agree on it.
    fn next_step(&self) -> Result<Step> {
        let mut inner = self.lock();

        if let Some(pending) = &inner.pending {
            debug!("joining in-flight code exchange");
            return Ok(Step::Exchange(pending.clone()));
        }

        if let Some(record) = self.usable_record() {
            inner.state = AuthState::Authenticated;
            return Ok(Step::Ready(record.access_token));
        }

        let outcome = if inner.redirect_consumed {
            None
        } else {
            redirect_outcome(&inner.location)
        };

        match outcome {
            Some(RedirectOutcome::Code(code)) => {
                inner.redirect_consumed = true;
                self.start_exchange(&mut inner, code).map(Step::Exchange)
            },
            Some(RedirectOutcome::Denied(reason)) => {
                inner.redirect_consumed = true;
                inner.state = AuthState::Unauthenticated;
                warn!(%reason, "authorization was denied");
                Err(AuthError::Denied(reason))
            },
            None => {
                if inner.state == AuthState::AwaitingRedirectBack {
                    return Err(AuthError::AuthorizationPending);
                }
                self.authorize_locked(&mut inner)?;
                Err(AuthError::AuthorizationPending)
            },
        }
    }

    fn authorize_locked(&self, inner: &mut FlowInner) -> Result<Url> {
        let redirect_uri = self.resolve_for(&inner.location)?;
        let pkce = PkceChallenge::generate(self.config.verifier_length);
        self.store.put_verifier(pkce.verifier.expose_secret())?;

        let url = self.authorize_url(&redirect_uri, &pkce.challenge)?;
        self.navigator
            .navigate(&url)
            .map_err(|e| AuthError::Navigation(e.to_string()))?;

        inner.state = AuthState::AwaitingRedirectBack;
        info!(%redirect_uri, "sent user agent to the authorization server");
        Ok(url)
    }

    fn start_exchange(&self, inner: &mut FlowInner, code: String) -> Result<PendingExchange> {
        let fail = |inner: &mut FlowInner, e: AuthError| {
            inner.state = AuthState::Unauthenticated;
            e
        };
        let redirect_uri = match self.resolve_for(&inner.location) {
            Ok(uri) => uri,
            Err(e) => return Err(fail(inner, e)),
        };
        let verifier = match self.store.take_verifier() {
            Ok(Some(v)) => v,
            Ok(None) => return Err(fail(inner, AuthError::MissingVerifier)),
            Err(e) => return Err(fail(inner, e)),
        };

        info!("exchanging authorization code");
        let form = vec![
            ("client_id", self.config.client_id.clone()),
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", redirect_uri.to_string()),
            ("code_verifier", verifier),
        ];
        let pending = exchange_code(
            self.client.clone(),
            self.config.token_url.clone(),
            form,
            Arc::clone(&self.store),
        )
        .boxed()
        .shared();

        inner.state = AuthState::ExchangingCode;
        inner.pending = Some(pending.clone());
        Ok(pending)
    }

    async fn finish_exchange(&self, pending: PendingExchange) -> Result<String> {
        let outcome = pending.clone().await;

        let mut inner = self.lock();
        if inner.pending.as_ref().is_some_and(|p| p.ptr_eq(&pending)) {
            inner.pending = None;
            inner.state = match outcome {
                Ok(_) => AuthState::Authenticated,
                Err(_) => AuthState::Unauthenticated,
            };
        }
        outcome.map(|record| record.access_token)
    }
}

fn redirect_outcome(location: &Url) -> Option<RedirectOutcome> {
    let mut denied = None;
    for (key, value) in location.query_pairs() {
        match key.as_ref() {
            "code" if !value.is_empty() => return Some(RedirectOutcome::Code(value.into_owned())),
            "error" => denied = Some(RedirectOutcome::Denied(value.into_owned())),
            _ => {},
        }
    }
    denied
}

async fn exchange_code(
    client: reqwest::Client,
    token_url: String,
    form: Vec<(&'static str, String)>,
    store: Arc<TokenStore>,
) -> Result<TokenRecord> {
    let resp = client
        .post(&token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| AuthError::Exchange {
            status: None,
            message: e.to_string(),
        })?;

    let status = resp.status();
    if !status.is_success() {
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "failed to read token error body");
                format!("(unreadable response body: {e})")
            },
        };
        warn!(status = status.as_u16(), "token endpoint rejected the code");
        return Err(AuthError::Exchange {
            status: Some(status.as_u16()),
            message: body,
        });
    }

    let mut record: TokenRecord = resp.json().await.map_err(|e| AuthError::Exchange {
        status: Some(status.as_u16()),
        message: format!("invalid token response: {e}"),
    })?;
    if record.access_token.is_empty() {
        return Err(AuthError::Exchange {
            status: Some(status.as_u16()),
            message: "token response has no access_token".into(),
        });
    }
    record.obtained_at = Some(unix_now());
    store.set(&record)?;
    info!(
        expires_in = record.expires_in,
        scope = %record.scope,
        "authorization code exchanged"
    );
    Ok(record)
}
