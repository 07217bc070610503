use std::{sync::Arc, time::Duration};

use {
    tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{client::SpotifyGateway, error::FetchError, models::PlayerState};

/// What the player view should show after the latest poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PlayerFeed {
    /// Nothing is playing, or no poll has completed yet.
    #[default]
    Idle,
    Playing(PlayerState),
    /// The last poll failed for a reason a login will not fix.
    Unavailable,
    /// Polls cannot reach the API until the user logs in again.
    LoginRequired,
}

impl PlayerFeed {
    pub fn state(&self) -> Option<&PlayerState> {
        match self {
            Self::Playing(state) => Some(state),
            _ => None,
        }
    }
}

/// Polls `/me/player` on a fixed interval and publishes a [`PlayerFeed`].
///
/// Subscribers are only woken when the playing item changes or the feed
/// moves to another variant.
pub struct PlayerPoller {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    rx: watch::Receiver<PlayerFeed>,
}

impl PlayerPoller {
    pub fn spawn(gateway: Arc<SpotifyGateway>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(PlayerFeed::Idle);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                let result = tokio::select! {
                    () = token.cancelled() => break,
                    result = gateway.player_state() => result,
                };
                tx.send_if_modified(|current| apply_update(current, result));
            }
            debug!("player poller stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
            rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerFeed> {
        self.rx.clone()
    }

    pub fn current(&self) -> PlayerFeed {
        self.rx.borrow().clone()
    }

    /// Cancel the poll loop and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "player poller task failed");
        }
    }
}

impl Drop for PlayerPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Fold one poll result into the published feed. Returns whether it changed.
fn apply_update(current: &mut PlayerFeed, result: Result<Option<PlayerState>, FetchError>) -> bool {
    let next = match result {
        Ok(Some(state)) => {
            if let PlayerFeed::Playing(prev) = current
                && prev.item_id() == state.item_id()
            {
                return false;
            }
            PlayerFeed::Playing(state)
        },
        Ok(None) => PlayerFeed::Idle,
        Err(e) if e.needs_login() => {
            if *current != PlayerFeed::LoginRequired {
                warn!(error = %e, "player poll needs a new login");
            }
            PlayerFeed::LoginRequired
        },
        Err(e) => {
            if *current == PlayerFeed::Unavailable {
                debug!(error = %e, "player poll still failing");
            } else {
                warn!(error = %e, "player poll failed");
            }
            PlayerFeed::Unavailable
        },
    };
    if *current == next {
        return false;
    }
    *current = next;
    true
}

#[cfg(test)]
mod tests {
    use {
        deeptrack_oauth::{
            AuthError, MemoryStore, Navigator, OAuthConfig, OAuthFlow, TokenRecord, TokenStore,
            redirect::default_rules,
        },
        mockito::Server,
        url::Url,
    };

    use {super::*, crate::models::Track};

    fn playing(id: &str, progress_ms: u64) -> PlayerState {
        PlayerState {
            is_playing: true,
            progress_ms: Some(progress_ms),
            item: Some(Track {
                id: Some(id.into()),
                name: id.to_uppercase(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_state_is_published() {
        let mut current = PlayerFeed::Idle;
        assert!(apply_update(&mut current, Ok(Some(playing("t1", 0)))));
        assert_eq!(current.state().unwrap().item_id(), Some("t1"));
    }

    #[test]
    fn test_same_item_is_not_republished() {
        let mut current = PlayerFeed::Playing(playing("t1", 0));
        assert!(!apply_update(&mut current, Ok(Some(playing("t1", 5_000)))));
        assert_eq!(current.state().unwrap().progress_ms, Some(0));
    }

    #[test]
    fn test_item_change_is_published() {
        let mut current = PlayerFeed::Playing(playing("t1", 0));
        assert!(apply_update(&mut current, Ok(Some(playing("t2", 0)))));
        assert_eq!(current.state().unwrap().item_id(), Some("t2"));
    }

    #[test]
    fn test_nothing_playing_clears() {
        let mut current = PlayerFeed::Playing(playing("t1", 0));
        assert!(apply_update(&mut current, Ok(None)));
        assert_eq!(current, PlayerFeed::Idle);
        assert!(!apply_update(&mut current, Ok(None)));
    }

    #[test]
    fn test_pending_login_is_distinct_from_idle() {
        let mut current = PlayerFeed::Playing(playing("t1", 0));
        assert!(apply_update(
            &mut current,
            Err(FetchError::Auth(AuthError::AuthorizationPending))
        ));
        assert_eq!(current, PlayerFeed::LoginRequired);
        assert!(current.state().is_none());
        assert!(!apply_update(
            &mut current,
            Err(FetchError::Auth(AuthError::AuthorizationPending))
        ));
        assert!(apply_update(&mut current, Ok(Some(playing("t1", 0)))));
    }

    #[test]
    fn test_other_failures_are_unavailable() {
        let mut current = PlayerFeed::Playing(playing("t1", 0));
        let failure = || FetchError::Status {
            url: "me/player".into(),
            status: 502,
            body: String::new(),
        };
        assert!(apply_update(&mut current, Err(failure())));
        assert_eq!(current, PlayerFeed::Unavailable);
        assert!(!apply_update(&mut current, Err(failure())));
    }

    struct NoopNavigator;

    impl Navigator for NoopNavigator {
        fn navigate(&self, _url: &Url) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn gateway(server: &Server) -> Arc<SpotifyGateway> {
        let store = Arc::new(TokenStore::new(Arc::new(MemoryStore::new())));
        store
            .set(&TokenRecord {
                access_token: "tok".into(),
                token_type: "Bearer".into(),
                expires_in: 3600,
                refresh_token: None,
                scope: String::new(),
                obtained_at: None,
            })
            .unwrap();
        let config = OAuthConfig {
            client_id: "cid".into(),
            auth_url: format!("{}/authorize", server.url()),
            token_url: format!("{}/api/token", server.url()),
            redirect_rules: default_rules(),
            scopes: vec![],
            verifier_length: 64,
            check_expiry: true,
        };
        let flow = Arc::new(OAuthFlow::new(
            config,
            store,
            Arc::new(NoopNavigator),
            Url::parse("http://127.0.0.1:4200/").unwrap(),
        ));
        Arc::new(SpotifyGateway::new(
            flow,
            Url::parse(&format!("{}/v1/", server.url())).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_poller_publishes_current_item() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/me/player")
            .with_status(200)
            .with_body(r#"{"is_playing":true,"item":{"id":"t1","name":"Song","artists":[{"name":"A"}]}}"#)
            .create_async()
            .await;

        let poller = PlayerPoller::spawn(gateway(&server), Duration::from_millis(10));
        let mut rx = poller.subscribe();
        let feed = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|feed| feed.state().is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(feed.state().unwrap().artist_names(), "A");
        assert!(poller.current().state().is_some());
        poller.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_loop_while_idle() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/me/player")
            .with_status(204)
            .expect_at_least(1)
            .create_async()
            .await;

        let poller = PlayerPoller::spawn(gateway(&server), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(poller.current(), PlayerFeed::Idle);
        tokio::time::timeout(Duration::from_secs(5), poller.stop())
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
