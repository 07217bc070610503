//! Loopback listener that receives the authorization server's redirect back.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use {
    anyhow::{Context, Result, bail},
    axum::{
        Router,
        extract::RawQuery,
        http::StatusCode,
        response::{Html, IntoResponse},
        routing::get,
    },
    tokio::{net::TcpListener, sync::oneshot, task::JoinHandle},
    tracing::{debug, error, info},
    url::Url,
};

type RedirectSlot = Arc<Mutex<Option<oneshot::Sender<Url>>>>;

/// Serves the redirect URI's path on its host and port until one redirect
/// carrying `code` or `error` arrives.
pub struct CallbackServer {
    redirect_uri: Url,
    local_addr: SocketAddr,
    redirect_rx: oneshot::Receiver<Url>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Whether `redirect_uri` can be received by a plain-HTTP loopback listener.
    pub fn supports(redirect_uri: &Url) -> bool {
        redirect_uri.scheme() == "http"
            && matches!(
                redirect_uri.host_str(),
                Some("127.0.0.1" | "localhost" | "[::1]")
            )
    }

    /// Bind the listener. Must happen before the browser is sent away.
    pub async fn bind(redirect_uri: &Url) -> Result<Self> {
        if !Self::supports(redirect_uri) {
            bail!("redirect URI {redirect_uri} is not a plain-HTTP loopback address");
        }
        let host = redirect_uri
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .context("redirect URI has no host")?;
        let port = redirect_uri.port_or_known_default().unwrap_or(80);

        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind OAuth callback listener on {host}:{port}"))?;
        let local_addr = listener.local_addr()?;

        let mut redirect_uri = redirect_uri.clone();
        if redirect_uri.port().is_some() {
            let _ = redirect_uri.set_port(Some(local_addr.port()));
        }

        let (redirect_tx, redirect_rx) = oneshot::channel();
        let slot: RedirectSlot = Arc::new(Mutex::new(Some(redirect_tx)));
        let base = redirect_uri.clone();
        let app = Router::new().route(
            redirect_uri.path(),
            get(move |query: RawQuery| handle_redirect(query, base.clone(), Arc::clone(&slot))),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!(%e, "OAuth callback server error");
            }
        });

        info!(%local_addr, path = redirect_uri.path(), "listening for OAuth redirect");
        Ok(Self {
            redirect_uri,
            local_addr,
            redirect_rx,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The redirect URI as served, with the bound port filled in.
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Wait for the redirect and return the full URL the browser landed on.
    pub async fn wait(mut self, timeout: Duration) -> Result<Url> {
        let rx = &mut self.redirect_rx;
        let url = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(url)) => url,
            Ok(Err(_)) => bail!("OAuth callback server stopped before a redirect arrived"),
            Err(_) => bail!(
                "timed out after {}s waiting for the OAuth redirect",
                timeout.as_secs()
            ),
        };
        self.shutdown().await;
        Ok(url)
    }

    async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!(%e, "OAuth callback server task failed");
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take()
            && !handle.is_finished()
        {
            handle.abort();
        }
    }
}

async fn handle_redirect(
    RawQuery(query): RawQuery,
    base: Url,
    slot: RedirectSlot,
) -> impl IntoResponse {
    let mut url = base;
    url.set_query(query.as_deref());

    let carries_outcome = url.query_pairs().any(|(k, _)| k == "code" || k == "error");
    if !carries_outcome {
        debug!("ignoring callback request without code or error");
        return (
            StatusCode::BAD_REQUEST,
            Html("<h1>Missing authorization code</h1>"),
        );
    }

    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    match sender {
        Some(tx) => {
            let _ = tx.send(url);
            (
                StatusCode::OK,
                Html(
                    "<h1>Authorization received</h1><p>You can close this window and return to the terminal.</p>",
                ),
            )
        },
        None => (
            StatusCode::CONFLICT,
            Html("<h1>Authorization already received</h1>"),
        ),
    }
}
