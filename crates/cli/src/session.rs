//! Wires configuration, durable storage, the authorization flow and the API
//! gateway together, and completes the browser round trip when a request
//! needs the user to log in.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use {
    anyhow::{Context, Result},
    deeptrack_config::{DeeptrackConfig, default_storage_path},
    deeptrack_gateway::{FetchError, SpotifyGateway},
    deeptrack_oauth::{
        AuthError, CallbackServer, FileStore, KeyValueStore, Navigator, OAuthConfig, OAuthFlow,
        RedirectRule, TokenStore, redirect::default_rules,
    },
    tokio::io::{AsyncBufReadExt, BufReader},
    tracing::{debug, info},
    url::Url,
};

/// Holds the authorize URL until the session is ready to receive the
/// redirect, then hands it to the system browser.
#[derive(Default)]
pub struct BrowserNavigator {
    queued: Mutex<Option<Url>>,
}

impl BrowserNavigator {
    pub fn take(&self) -> Option<Url> {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Navigator for BrowserNavigator {
    fn navigate(&self, url: &Url) -> Result<()> {
        debug!(host = url.host_str(), "authorize URL queued");
        *self.queued.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.clone());
        Ok(())
    }
}

/// Hands the authorize URL to something that can show it to the user.
pub type BrowserOpener = Arc<dyn Fn(&Url) -> Result<()> + Send + Sync>;

pub struct Session {
    config: DeeptrackConfig,
    flow: Arc<OAuthFlow>,
    gateway: Arc<SpotifyGateway>,
    navigator: Arc<BrowserNavigator>,
    opener: BrowserOpener,
    login_lock: tokio::sync::Mutex<()>,
}

impl Session {
    /// Open a session backed by the configured storage file.
    pub fn open(config: DeeptrackConfig) -> Result<Self> {
        let path = match &config.storage.path {
            Some(path) => path.clone(),
            None => default_storage_path()?,
        };
        debug!(path = %path.display(), "using storage file");
        Self::with_backend(config, Arc::new(FileStore::new(path)))
    }

    pub fn with_backend(config: DeeptrackConfig, backend: Arc<dyn KeyValueStore>) -> Result<Self> {
        let location = Url::parse(&config.app.location)
            .with_context(|| format!("app.location is not a valid URL: {}", config.app.location))?;
        let api_base = Url::parse(&config.spotify.api_url)
            .with_context(|| format!("spotify.api_url is not a valid URL: {}", config.spotify.api_url))?;

        let navigator = Arc::new(BrowserNavigator::default());
        let store = Arc::new(TokenStore::new(backend));
        let flow = Arc::new(OAuthFlow::new(
            oauth_config(&config)?,
            store,
            navigator.clone(),
            location,
        ));
        let gateway = Arc::new(
            SpotifyGateway::new(Arc::clone(&flow), api_base)
                .reauthorize_on_unauthorized(config.app.reauthorize_on_unauthorized),
        );

        Ok(Self {
            config,
            flow,
            gateway,
            navigator,
            opener: Arc::new(|url: &Url| -> Result<()> {
                open::that(url.as_str())?;
                Ok(())
            }),
            login_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Replace the system browser as the way the authorize URL is opened.
    pub fn with_opener(mut self, opener: BrowserOpener) -> Self {
        self.opener = opener;
        self
    }

    pub fn config(&self) -> &DeeptrackConfig {
        &self.config
    }

    pub fn flow(&self) -> &Arc<OAuthFlow> {
        &self.flow
    }

    pub fn gateway(&self) -> &Arc<SpotifyGateway> {
        &self.gateway
    }

    /// Run `op`, and if it failed because the user has to log in, complete the
    /// authorization round trip and run it once more.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<SpotifyGateway>) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        match op(Arc::clone(&self.gateway)).await {
            Err(e) if e.needs_login() => {
                debug!(error = %e, "login required");
                self.complete_authorization().await?;
                Ok(op(Arc::clone(&self.gateway)).await?)
            },
            other => Ok(other?),
        }
    }

    /// Ensure a usable access token exists, logging in if necessary.
    pub async fn ensure_token(&self) -> Result<()> {
        self.call(|gateway| async move {
            gateway
                .flow()
                .current_token()
                .await
                .map(|_| ())
                .map_err(FetchError::from)
        })
        .await
    }

    /// Send the browser to the authorization server and wait for it to come
    /// back. Concurrent callers share one round trip.
    pub async fn complete_authorization(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        if self.flow.is_authenticated() {
            return Ok(());
        }

        let redirect_uri = self.flow.redirect_uri()?;
        let server = if CallbackServer::supports(&redirect_uri) {
            Some(CallbackServer::bind(&redirect_uri).await?)
        } else {
            None
        };

        let authorize_url = match self.navigator.take() {
            Some(url) => url,
            None => match self.flow.current_token().await {
                Ok(_) => return Ok(()),
                Err(AuthError::AuthorizationPending) => match self.navigator.take() {
                    Some(url) => url,
                    None => {
                        let url = self.flow.begin_authorization()?;
                        self.navigator.take();
                        url
                    },
                },
                Err(e) => return Err(e.into()),
            },
        };

        println!("Opening browser to log in to Spotify...");
        if (self.opener)(&authorize_url).is_err() {
            println!("Could not open browser. Please visit:\n{authorize_url}");
        }

        let landed = match server {
            Some(server) => {
                println!("Waiting for the redirect on {} ...", server.redirect_uri());
                server
                    .wait(Duration::from_secs(self.config.app.login_timeout_secs))
                    .await?
            },
            None => prompt_for_redirect(&redirect_uri).await?,
        };

        self.flow.load(landed);
        self.flow.current_token().await?;
        info!("authorization complete");
        Ok(())
    }
}

/// Build the flow configuration; an empty `redirects` list means the built-in
/// allow-list.
pub fn oauth_config(config: &DeeptrackConfig) -> Result<OAuthConfig> {
    let redirect_rules = if config.redirects.is_empty() {
        default_rules()
    } else {
        config
            .redirects
            .iter()
            .map(|entry| {
                Ok(RedirectRule {
                    host_contains: entry.host_contains.clone(),
                    redirect_uri: Url::parse(&entry.uri)
                        .with_context(|| format!("invalid redirect uri {}", entry.uri))?,
                })
            })
            .collect::<Result<Vec<_>>>()?
    };

    Ok(OAuthConfig {
        client_id: config.spotify.client_id.clone(),
        auth_url: config.spotify.authorize_url(),
        token_url: config.spotify.token_url(),
        redirect_rules,
        scopes: config.spotify.scopes.clone(),
        verifier_length: config.app.verifier_length,
        check_expiry: config.app.check_token_expiry,
    })
}

/// For redirect URIs nothing local can listen on, ask the user to paste the
/// address the browser ended up at.
async fn prompt_for_redirect(redirect_uri: &Url) -> Result<Url> {
    println!("After approving, paste the full address the browser was sent to");
    println!("(it starts with {redirect_uri}):");

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read the redirect address")?;
    parse_redirect(&line)
}

fn parse_redirect(input: &str) -> Result<Url> {
    let url = Url::parse(input.trim())
        .with_context(|| format!("not a URL: {}", input.trim()))?;
    if !url.query_pairs().any(|(k, _)| k == "code" || k == "error") {
        anyhow::bail!("the address carries neither a code nor an error");
    }
    Ok(url)
}
