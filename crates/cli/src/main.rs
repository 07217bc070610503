mod auth_commands;
mod session;
mod view_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::{
    session::Session,
    view_commands::{RangeArg, TopKind},
};

#[derive(Parser)]
#[command(name = "deeptrack", about = "Deep-Track, your Spotify listening at a glance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Path to deeptrack.toml.
    #[arg(long, global = true, env = "DEEPTRACK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Authentication management.
    Auth {
        #[command(subcommand)]
        action: auth_commands::AuthAction,
    },
    /// Show the logged-in user's profile.
    Profile,
    /// Top artists or tracks.
    Top {
        #[arg(value_enum)]
        kind: TopKind,
        #[arg(long, value_enum, default_value_t = RangeArg::Short)]
        range: RangeArg,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Only fetch the first page instead of following `next` once.
        #[arg(long)]
        first_page: bool,
    },
    /// Show what is playing right now.
    NowPlaying {
        /// Keep polling and print whenever the track changes.
        #[arg(long)]
        watch: bool,
    },
    /// Profile, top five artists and tracks, and the live player.
    Dashboard {
        /// Stop after this many seconds instead of waiting for ctrl-c.
        #[arg(long)]
        duration: Option<u64>,
    },
    /// GET an API path (relative to the API base, or an absolute URL on the API host) and print
    /// the JSON.
    Fetch { path: String },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "deeptrack starting");

    let config = deeptrack_config::load_config(cli.config.as_deref())?;
    let session = Session::open(config)?;

    match cli.command {
        Commands::Auth { action } => auth_commands::handle_auth(&session, action).await,
        Commands::Profile => view_commands::profile(&session).await,
        Commands::Top {
            kind,
            range,
            limit,
            first_page,
        } => view_commands::top(&session, kind, range, limit, !first_page).await,
        Commands::NowPlaying { watch } => view_commands::now_playing(&session, watch).await,
        Commands::Dashboard { duration } => view_commands::dashboard(&session, duration).await,
        Commands::Fetch { path } => view_commands::fetch(&session, &path).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_top_defaults() {
        let cli = Cli::try_parse_from(["deeptrack", "top", "tracks"]).unwrap();
        match cli.command {
            Commands::Top {
                kind,
                range,
                limit,
                first_page,
            } => {
                assert_eq!(kind, TopKind::Tracks);
                assert_eq!(range, RangeArg::Short);
                assert_eq!(limit, 50);
                assert!(!first_page);
            },
            _ => panic!("expected top"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "deeptrack",
            "dashboard",
            "--duration",
            "30",
            "--log-level",
            "debug",
            "--config",
            "/tmp/deeptrack.toml",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/deeptrack.toml")));
        assert!(matches!(cli.command, Commands::Dashboard {
            duration: Some(30)
        }));
    }

    #[test]
    fn test_parse_auth_login_force() {
        let cli = Cli::try_parse_from(["deeptrack", "auth", "login", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Auth {
            action: auth_commands::AuthAction::Login { force: true }
        }));
    }

    #[test]
    fn test_parse_top_first_page_only() {
        let cli = Cli::try_parse_from(["deeptrack", "top", "artists", "--first-page"]).unwrap();
        assert!(matches!(cli.command, Commands::Top {
            first_page: true,
            ..
        }));
    }

    #[test]
    fn test_rejects_unknown_range() {
        assert!(Cli::try_parse_from(["deeptrack", "top", "artists", "--range", "forever"]).is_err());
    }
}
