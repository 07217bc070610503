use std::sync::Arc;

use {
    deeptrack_oauth::OAuthFlow,
    reqwest::StatusCode,
    serde::de::DeserializeOwned,
    tracing::{debug, warn},
    url::Url,
};

use crate::{
    error::FetchError,
    models::{Artist, Paging, PlayerState, Profile, TimeRange, Track},
};

/// A response body passed through without interpretation.
///
/// `204 No Content` and empty bodies are `Value::Null`.
pub type Resource = serde_json::Value;

/// Issues bearer-authenticated GETs against the Web API, obtaining the token
/// from the authorization flow before every call.
pub struct SpotifyGateway {
    flow: Arc<OAuthFlow>,
    client: reqwest::Client,
    api_base: Url,
    reauthorize_on_unauthorized: bool,
}

impl SpotifyGateway {
    pub fn new(flow: Arc<OAuthFlow>, api_base: Url) -> Self {
        Self::with_client(flow, api_base, reqwest::Client::new())
    }

    pub fn with_client(flow: Arc<OAuthFlow>, mut api_base: Url, client: reqwest::Client) -> Self {
        // `Url::join` replaces the last segment unless the base ends in '/'.
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }
        Self {
            flow,
            client,
            api_base,
            reauthorize_on_unauthorized: true,
        }
    }

    /// Whether a 401/403 clears the token and restarts authorization.
    pub fn reauthorize_on_unauthorized(mut self, enabled: bool) -> Self {
        self.reauthorize_on_unauthorized = enabled;
        self
    }

    pub fn flow(&self) -> &Arc<OAuthFlow> {
        &self.flow
    }

    /// Paths are relative to the API base. Absolute URLs are accepted only on
    /// the API base's origin, since the bearer token goes with the request.
    pub fn resolve(&self, url: &str) -> Result<Url, FetchError> {
        let parsed = match Url::parse(url) {
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.api_base.join(url.trim_start_matches('/'))
            },
            other => other,
        };
        let resolved = parsed.map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        if resolved.origin() != self.api_base.origin() {
            return Err(FetchError::ForeignOrigin {
                url: resolved.to_string(),
            });
        }
        Ok(resolved)
    }

    pub async fn fetch(&self, url: &str) -> Result<Resource, FetchError> {
        let url = self.resolve(url)?;
        let token = self.flow.current_token().await?;

        debug!(%url, "GET");
        let resp = self
            .client
            .get(url.clone())
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            if self.reauthorize_on_unauthorized {
                self.flow.reauthorize()?;
            } else {
                warn!(%url, status = status.as_u16(), "access token rejected");
            }
            return Err(FetchError::Unauthorized {
                url: url.to_string(),
                status: status.as_u16(),
                reauthorizing: self.reauthorize_on_unauthorized,
            });
        }
        if !status.is_success() {
            let body = read_error_body(resp).await;
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Resource::Null);
        }

        let bytes = resp.bytes().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;
        if bytes.is_empty() {
            return Ok(Resource::Null);
        }
        serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resource = self.fetch(url).await?;
        serde_json::from_value(resource).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Like [`SpotifyGateway::get`], with an empty body mapped to `None`.
    pub async fn get_optional<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, FetchError> {
        match self.fetch(url).await? {
            Resource::Null => Ok(None),
            resource => serde_json::from_value(resource)
                .map(Some)
                .map_err(|source| FetchError::Decode {
                    url: url.to_string(),
                    source,
                }),
        }
    }

    pub async fn profile(&self) -> Result<Profile, FetchError> {
        self.get("me").await
    }

    pub async fn top_artists(
        &self,
        range: TimeRange,
        limit: u32,
        offset: u32,
    ) -> Result<Paging<Artist>, FetchError> {
        self.get(&top_path("artists", range, limit, offset)).await
    }

    pub async fn top_tracks(
        &self,
        range: TimeRange,
        limit: u32,
        offset: u32,
    ) -> Result<Paging<Track>, FetchError> {
        self.get(&top_path("tracks", range, limit, offset)).await
    }

    /// `None` when nothing is playing.
    pub async fn player_state(&self) -> Result<Option<PlayerState>, FetchError> {
        self.get_optional("me/player").await
    }

    /// Fetch the page after `page`, if there is one.
    pub async fn next_page<T: DeserializeOwned>(
        &self,
        page: &Paging<T>,
    ) -> Result<Option<Paging<T>>, FetchError> {
        match page.next.as_deref() {
            Some(next) => self.get(next).await.map(Some),
            None => Ok(None),
        }
    }
}

async fn read_error_body(resp: reqwest::Response) -> String {
    match resp.text().await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "failed to read error response body");
            format!("(unreadable response body: {e})")
        },
    }
}

fn top_path(kind: &str, range: TimeRange, limit: u32, offset: u32) -> String {
    format!("me/top/{kind}?time_range={range}&limit={limit}&offset={offset}")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use {
        deeptrack_oauth::{
            MemoryStore, Navigator, OAuthConfig, TokenRecord, TokenStore, redirect::default_rules,
        },
        mockito::{Matcher, Server},
    };

    use super::*;

    #[derive(Default)]
    struct RecordingNavigator {
        visits: Mutex<Vec<Url>>,
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, url: &Url) -> anyhow::Result<()> {
            self.visits.lock().unwrap().push(url.clone());
            Ok(())
        }
    }

    struct Harness {
        gateway: Arc<SpotifyGateway>,
        navigator: Arc<RecordingNavigator>,
    }

    fn harness(server: &Server, location: &str, token: Option<&str>) -> Harness {
        let store = Arc::new(TokenStore::new(Arc::new(MemoryStore::new())));
        if let Some(token) = token {
            store
                .set(&TokenRecord {
                    access_token: token.into(),
                    token_type: "Bearer".into(),
                    expires_in: 3600,
                    refresh_token: None,
                    scope: String::new(),
                    obtained_at: None,
                })
                .unwrap();
        }
        let navigator = Arc::new(RecordingNavigator::default());
        let config = OAuthConfig {
            client_id: "cid".into(),
            auth_url: format!("{}/authorize", server.url()),
            token_url: format!("{}/api/token", server.url()),
            redirect_rules: default_rules(),
            scopes: vec!["user-read-private".into()],
            verifier_length: 64,
            check_expiry: true,
        };
        let flow = Arc::new(OAuthFlow::new(
            config,
            store,
            navigator.clone(),
            Url::parse(location).unwrap(),
        ));
        let api_base = Url::parse(&format!("{}/v1", server.url())).unwrap();
        Harness {
            gateway: Arc::new(SpotifyGateway::new(flow, api_base)),
            navigator,
        }
    }

    #[tokio::test]
    async fn test_fetch_attaches_bearer_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/me")
            .match_header("authorization", "Bearer BQDstored")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"user1","display_name":"User One","images":[]}"#)
            .create_async()
            .await;

        let h = harness(&server, "http://127.0.0.1:4200/", Some("BQDstored"));
        let profile = h.gateway.profile().await.unwrap();
        assert_eq!(profile.name(), "User One");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_top_items_query() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/me/top/tracks")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("time_range".into(), "short_term".into()),
                Matcher::UrlEncoded("limit".into(), "5".into()),
                Matcher::UrlEncoded("offset".into(), "0".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"items":[{"id":"t1","name":"Song","artists":[{"name":"A"}]}],"next":null}"#)
            .create_async()
            .await;

        let h = harness(&server, "http://127.0.0.1:4200/", Some("tok"));
        let page = h
            .gateway
            .top_tracks(TimeRange::ShortTerm, 5, 0)
            .await
            .unwrap();
        assert_eq!(page.items[0].artist_names(), "A");
        assert!(h.gateway.next_page(&page).await.unwrap().is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_next_page_follows_absolute_url() {
        let mut server = Server::new_async().await;
        let next = format!("{}/v1/me/top/artists?offset=50&limit=50", server.url());
        let first = server
            .mock("GET", "/v1/me/top/artists")
            .match_query(Matcher::UrlEncoded("offset".into(), "0".into()))
            .with_status(200)
            .with_body(format!(r#"{{"items":[{{"id":"a","name":"A"}}],"next":"{next}"}}"#))
            .create_async()
            .await;
        let second = server
            .mock("GET", "/v1/me/top/artists")
            .match_query(Matcher::UrlEncoded("offset".into(), "50".into()))
            .with_status(200)
            .with_body(r#"{"items":[{"id":"b","name":"B"}],"next":null}"#)
            .create_async()
            .await;

        let h = harness(&server, "http://127.0.0.1:4200/", Some("tok"));
        let page = h
            .gateway
            .top_artists(TimeRange::ShortTerm, 50, 0)
            .await
            .unwrap();
        let more = h.gateway.next_page(&page).await.unwrap().unwrap();
        assert_eq!(more.items[0].name, "B");
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_content_is_null() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/me/player")
            .with_status(204)
            .create_async()
            .await;

        let h = harness(&server, "http://127.0.0.1:4200/", Some("tok"));
        assert_eq!(h.gateway.fetch("me/player").await.unwrap(), Resource::Null);
        assert!(h.gateway.player_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_clears_store_and_restarts_authorization() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/me")
            .with_status(401)
            .with_body(r#"{"error":{"status":401,"message":"The access token expired"}}"#)
            .create_async()
            .await;

        let h = harness(&server, "http://127.0.0.1:4200/", Some("BQDexpired"));
        let err = h.gateway.fetch("me").await.unwrap_err();
        assert!(matches!(err, FetchError::Unauthorized {
            status: 401,
            reauthorizing: true,
            ..
        }));
        assert!(err.needs_login());
        assert!(h.gateway.flow().store().get().is_none());
        assert_eq!(h.navigator.visits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_without_policy_keeps_token() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/me")
            .with_status(403)
            .create_async()
            .await;

        let mut h = harness(&server, "http://127.0.0.1:4200/", Some("tok"));
        h.gateway = Arc::new(
            Arc::into_inner(h.gateway)
                .unwrap()
                .reauthorize_on_unauthorized(false),
        );
        let err = h.gateway.fetch("me").await.unwrap_err();
        assert!(!err.needs_login());
        assert!(h.gateway.flow().store().get().is_some());
        assert!(h.navigator.visits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_keeps_token() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/me")
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let h = harness(&server, "http://127.0.0.1:4200/", Some("tok"));
        let err = h.gateway.fetch("me").await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
        assert!(h.gateway.flow().store().get().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_exchange() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/api/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"BQDnew","token_type":"Bearer","expires_in":3600,"scope":""}"#)
            .expect(1)
            .create_async()
            .await;
        let me = server
            .mock("GET", "/v1/me")
            .match_header("authorization", "Bearer BQDnew")
            .with_status(200)
            .with_body(r#"{"id":"user1"}"#)
            .expect(6)
            .create_async()
            .await;

        let h = harness(&server, "http://127.0.0.1:4200/callback?code=XYZ", None);
        h.gateway.flow().store().put_verifier("abc123").unwrap();

        let calls = (0..6).map(|_| {
            let gateway = Arc::clone(&h.gateway);
            tokio::spawn(async move { gateway.profile().await })
        });
        for result in futures::future::join_all(calls).await {
            assert_eq!(result.unwrap().unwrap().id, "user1");
        }
        token.assert_async().await;
        me.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_without_token_starts_authorization() {
        let server = Server::new_async().await;
        let h = harness(&server, "http://127.0.0.1:4200/", None);
        let err = h.gateway.fetch("me").await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Auth(deeptrack_oauth::AuthError::AuthorizationPending)
        ));
        assert_eq!(h.navigator.visits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_origin_is_refused_before_sending_token() {
        let mut server = Server::new_async().await;
        let other = Server::new_async().await;
        let leaked = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let h = harness(&other, "http://127.0.0.1:4200/", Some("tok"));
        let target = format!("{}/v1/me", server.url());
        let err = h.gateway.fetch(&target).await.unwrap_err();
        assert!(matches!(err, FetchError::ForeignOrigin { .. }));
        assert!(!err.needs_login());
        assert!(
            h.gateway
                .next_page(&Paging::<Artist> {
                    href: String::new(),
                    items: vec![],
                    limit: 50,
                    next: Some("https://evil.example/v1/me/top/artists?offset=50".into()),
                    offset: 0,
                    previous: None,
                    total: 60,
                })
                .await
                .is_err()
        );
        assert!(h.navigator.visits.lock().unwrap().is_empty());
        leaked.assert_async().await;
    }

    #[tokio::test]
    async fn test_truncated_error_body_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 100\r\n\r\nshort")
                .await;
        });

        let server = Server::new_async().await;
        let h = harness(&server, "http://127.0.0.1:4200/", Some("tok"));
        let gateway = SpotifyGateway::new(
            Arc::clone(h.gateway.flow()),
            Url::parse(&format!("http://{addr}/v1")).unwrap(),
        );

        match gateway.fetch("me").await.unwrap_err() {
            FetchError::Status { status, body, .. } => {
                assert_eq!(status, 503);
                assert!(body.starts_with("(unreadable response body"), "{body}");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let server_url = "http://127.0.0.1:9";
        let store = Arc::new(TokenStore::new(Arc::new(MemoryStore::new())));
        let config = OAuthConfig {
            client_id: "cid".into(),
            auth_url: format!("{server_url}/authorize"),
            token_url: format!("{server_url}/api/token"),
            redirect_rules: default_rules(),
            scopes: vec![],
            verifier_length: 64,
            check_expiry: true,
        };
        let flow = Arc::new(OAuthFlow::new(
            config,
            store,
            Arc::new(RecordingNavigator::default()),
            Url::parse("http://127.0.0.1:4200/").unwrap(),
        ));
        let gateway = SpotifyGateway::new(flow, Url::parse("https://api.spotify.com/v1").unwrap());
        assert_eq!(
            gateway.resolve("me/player").unwrap().as_str(),
            "https://api.spotify.com/v1/me/player"
        );
        assert_eq!(
            gateway.resolve("/me").unwrap().as_str(),
            "https://api.spotify.com/v1/me"
        );
        assert_eq!(
            gateway
                .resolve("https://api.spotify.com/v1/me/top/artists?offset=50")
                .unwrap()
                .as_str(),
            "https://api.spotify.com/v1/me/top/artists?offset=50"
        );
    }
}
