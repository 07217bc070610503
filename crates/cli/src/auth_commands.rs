use std::time::{SystemTime, UNIX_EPOCH};

use {
    anyhow::Result,
    clap::Subcommand,
    deeptrack_oauth::TokenRecord,
};

use crate::session::Session;

#[derive(Subcommand)]
pub enum AuthAction {
    /// Log in to Spotify in the browser.
    Login {
        /// Discard any stored token first.
        #[arg(long)]
        force: bool,
    },
    /// Show whether a token is stored and when it expires.
    Status,
    /// Remove the stored token.
    Logout,
}

pub async fn handle_auth(session: &Session, action: AuthAction) -> Result<()> {
    match action {
        AuthAction::Login { force } => login(session, force).await,
        AuthAction::Status => status(session),
        AuthAction::Logout => logout(session),
    }
}

async fn login(session: &Session, force: bool) -> Result<()> {
    if force {
        session.flow().invalidate()?;
    } else if session.flow().is_authenticated() {
        println!("Already logged in. Use --force to log in again.");
        return Ok(());
    }

    session.complete_authorization().await?;
    let profile = session
        .call(|gateway| async move { gateway.profile().await })
        .await?;
    println!("Logged in as {}", profile.name());
    Ok(())
}

fn status(session: &Session) -> Result<()> {
    match session.flow().store().get() {
        None => println!("Not logged in."),
        Some(record) => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            println!("Logged in [{}]", describe_expiry(&record, now));
            if !record.scope.is_empty() {
                println!("Scopes: {}", record.scope);
            }
        },
    }
    Ok(())
}

fn logout(session: &Session) -> Result<()> {
    session.flow().invalidate()?;
    println!("Logged out.");
    Ok(())
}

fn describe_expiry(record: &TokenRecord, now: u64) -> String {
    match record.expires_at() {
        None => "expiry unknown".to_string(),
        Some(at) if at > now => {
            let remaining = at - now;
            let hours = remaining / 3600;
            let mins = (remaining % 3600) / 60;
            format!("valid ({hours}h {mins}m remaining)")
        },
        Some(_) => "expired".to_string(),
    }
}
