use std::{fmt::Write as _, sync::Arc, time::Duration};

use {
    anyhow::Result,
    clap::ValueEnum,
    deeptrack_gateway::{
        Artist, FetchError, Paging, PlayerFeed, PlayerPoller, PlayerState, Profile, TimeRange,
        Track,
    },
    serde::de::DeserializeOwned,
    tracing::warn,
};

use crate::session::Session;

const DASHBOARD_TOP_LIMIT: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TopKind {
    Artists,
    Tracks,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum RangeArg {
    /// About four weeks.
    #[default]
    Short,
    /// About six months.
    Medium,
    /// Several years.
    Long,
}

impl From<RangeArg> for TimeRange {
    fn from(range: RangeArg) -> Self {
        match range {
            RangeArg::Short => Self::ShortTerm,
            RangeArg::Medium => Self::MediumTerm,
            RangeArg::Long => Self::LongTerm,
        }
    }
}

/// GET an arbitrary API path and print the JSON as received.
pub async fn fetch(session: &Session, path: &str) -> Result<()> {
    let path = path.to_string();
    let resource = session
        .call(|gateway| {
            let path = path.clone();
            async move { gateway.fetch(&path).await }
        })
        .await?;
    println!("{}", serde_json::to_string_pretty(&resource)?);
    Ok(())
}

pub async fn profile(session: &Session) -> Result<()> {
    let profile = session
        .call(|gateway| async move { gateway.profile().await })
        .await?;
    print!("{}", render_profile(&profile));
    Ok(())
}

/// Table view: one page of top items, followed by the next page unless
/// `follow_next` is off.
pub async fn top(
    session: &Session,
    kind: TopKind,
    range: RangeArg,
    limit: u32,
    follow_next: bool,
) -> Result<()> {
    let range = TimeRange::from(range);
    match kind {
        TopKind::Artists => {
            let mut page = session
                .call(|gateway| async move { gateway.top_artists(range, limit, 0).await })
                .await?;
            if follow_next {
                extend_with_next(session, &mut page).await?;
            }
            print!("{}", render_artist_table(&page.items));
        },
        TopKind::Tracks => {
            let mut page = session
                .call(|gateway| async move { gateway.top_tracks(range, limit, 0).await })
                .await?;
            if follow_next {
                extend_with_next(session, &mut page).await?;
            }
            print!("{}", render_track_table(&page.items));
        },
    }
    Ok(())
}

async fn extend_with_next<T>(session: &Session, page: &mut Paging<T>) -> Result<()>
where
    T: DeserializeOwned,
{
    let Some(next) = page.next.clone() else {
        return Ok(());
    };
    let more: Paging<T> = session
        .call(|gateway| {
            let next = next.clone();
            async move { gateway.get(&next).await }
        })
        .await?;
    page.items.extend(more.items);
    page.next = more.next;
    Ok(())
}

pub async fn now_playing(session: &Session, watch: bool) -> Result<()> {
    if !watch {
        let state = session
            .call(|gateway| async move { gateway.player_state().await })
            .await?;
        println!("{}", render_now_playing(state.as_ref()));
        return Ok(());
    }
    session.ensure_token().await?;
    watch_player(session, None).await
}

/// Home view: profile header, top five artists and tracks fetched
/// concurrently, then the live player until interrupted.
pub async fn dashboard(session: &Session, duration: Option<u64>) -> Result<()> {
    session.ensure_token().await?;

    let (profile, artists, tracks) = tokio::join!(
        session.call(|gateway| async move { gateway.profile().await }),
        session.call(|gateway| async move {
            gateway
                .top_artists(TimeRange::ShortTerm, DASHBOARD_TOP_LIMIT, 0)
                .await
        }),
        session.call(|gateway| async move {
            gateway
                .top_tracks(TimeRange::ShortTerm, DASHBOARD_TOP_LIMIT, 0)
                .await
        }),
    );

    print!("{}", section("Profile", profile, |p| render_profile(&p)));
    print!(
        "{}",
        section("Top artists", artists, |p| render_artist_table(&p.items))
    );
    print!(
        "{}",
        section("Top tracks", tracks, |p| render_track_table(&p.items))
    );
    println!("\nNow playing");

    watch_player(session, duration.map(Duration::from_secs)).await
}

async fn watch_player(session: &Session, limit: Option<Duration>) -> Result<()> {
    let interval = Duration::from_millis(session.config().app.poll_interval_ms);
    let poller = PlayerPoller::spawn(Arc::clone(session.gateway()), interval);
    let mut rx = poller.subscribe();

    let watch = async {
        loop {
            if rx.changed().await.is_err() {
                return Ok::<_, anyhow::Error>(());
            }
            let feed = rx.borrow_and_update().clone();
            println!("{}", render_feed(&feed));
            if feed == PlayerFeed::LoginRequired {
                session.complete_authorization().await?;
            }
        }
    };
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        result = watch => result,
        () = deadline => Ok(()),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            Ok(())
        },
    };
    poller.stop().await;
    outcome
}

fn section<T>(
    title: &str,
    result: Result<T>,
    render: impl FnOnce(T) -> String,
) -> String {
    match result {
        Ok(value) => format!("{title}\n{}", render(value)),
        Err(e) => {
            warn!(section = title, error = %e, "section unavailable");
            let reason = match e.downcast_ref::<FetchError>() {
                Some(FetchError::Unauthorized { .. }) => "not authorized",
                _ => "unavailable",
            };
            format!("{title}\n  ({reason})\n")
        },
    }
}

pub fn render_profile(profile: &Profile) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  {}", profile.name());
    if let Some(email) = &profile.email {
        let _ = writeln!(out, "  email:     {email}");
    }
    if let Some(country) = &profile.country {
        let _ = writeln!(out, "  country:   {country}");
    }
    if let Some(product) = &profile.product {
        let _ = writeln!(out, "  plan:      {product}");
    }
    if let Some(followers) = &profile.followers {
        let _ = writeln!(out, "  followers: {}", followers.total);
    }
    out
}

pub fn render_artist_table(artists: &[Artist]) -> String {
    if artists.is_empty() {
        return "  (no artists)\n".into();
    }
    let mut out = String::new();
    for (i, artist) in artists.iter().enumerate() {
        let _ = write!(out, "{:>4}  {}", i + 1, artist.name);
        if !artist.genres.is_empty() {
            let _ = write!(out, "  [{}]", artist.genres.join(", "));
        }
        out.push('\n');
    }
    out
}

pub fn render_track_table(tracks: &[Track]) -> String {
    if tracks.is_empty() {
        return "  (no tracks)\n".into();
    }
    let mut out = String::new();
    for (i, track) in tracks.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>4}  {}  {}  {}",
            i + 1,
            track.name,
            track.artist_names(),
            format_duration(track.duration_ms)
        );
    }
    out
}

pub fn render_now_playing(state: Option<&PlayerState>) -> String {
    let Some(track) = state.and_then(|s| s.item.as_ref()) else {
        return "  Nothing playing".into();
    };
    let marker = if state.is_some_and(|s| s.is_playing) {
        ">"
    } else {
        "||"
    };
    format!("  {marker} {}  {}", track.name, track.artist_names())
}

pub fn render_feed(feed: &PlayerFeed) -> String {
    match feed {
        PlayerFeed::LoginRequired => "  (login required)".into(),
        PlayerFeed::Unavailable => "  (unavailable)".into(),
        other => render_now_playing(other.state()),
    }
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}
