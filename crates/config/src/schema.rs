use std::path::PathBuf;

use {
    anyhow::{Context, bail},
    serde::{Deserialize, Serialize},
    url::Url,
};

/// Public client id registered for the Deep-Track app.
pub const DEFAULT_CLIENT_ID: &str = "8c075a7f139146519b4e9fac7ce3439d";

/// Root of `deeptrack.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeeptrackConfig {
    pub spotify: SpotifyConfig,
    pub app: AppConfig,
    /// Ordered allow-list of redirect URIs; the first host match wins.
    /// Empty means the built-in allow-list.
    pub redirects: Vec<RedirectEntry>,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub accounts_url: String,
    pub api_url: String,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.into(),
            scopes: [
                "user-read-private",
                "user-read-email",
                "user-top-read",
                "user-read-playback-state",
                "user-read-currently-playing",
            ]
            .map(String::from)
            .to_vec(),
            accounts_url: "https://accounts.spotify.com".into(),
            api_url: "https://api.spotify.com/v1".into(),
        }
    }
}

impl SpotifyConfig {
    pub fn authorize_url(&self) -> String {
        format!("{}/authorize", self.accounts_url.trim_end_matches('/'))
    }

    pub fn token_url(&self) -> String {
        format!("{}/api/token", self.accounts_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Location the app considers itself served from; selects the redirect URI.
    pub location: String,
    /// Clear the token and restart authorization on a 401/403.
    pub reauthorize_on_unauthorized: bool,
    pub check_token_expiry: bool,
    pub poll_interval_ms: u64,
    pub verifier_length: usize,
    /// Seconds to wait for the redirect back before giving up.
    pub login_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            location: "http://127.0.0.1:4200/".into(),
            reauthorize_on_unauthorized: true,
            check_token_expiry: true,
            poll_interval_ms: 1000,
            verifier_length: 128,
            login_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectEntry {
    pub host_contains: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Durable storage file; defaults to `<data_dir>/deeptrack/storage.json`.
    pub path: Option<PathBuf>,
}

impl DeeptrackConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.spotify.client_id.trim().is_empty() {
            bail!("spotify.client_id must not be empty");
        }
        for (field, value) in [
            ("spotify.accounts_url", &self.spotify.accounts_url),
            ("spotify.api_url", &self.spotify.api_url),
            ("app.location", &self.app.location),
        ] {
            Url::parse(value).with_context(|| format!("{field} is not a valid URL: {value}"))?;
        }
        for entry in &self.redirects {
            if entry.host_contains.is_empty() {
                bail!("redirects entry for {} has an empty host_contains", entry.uri);
            }
            Url::parse(&entry.uri)
                .with_context(|| format!("redirect uri is not a valid URL: {}", entry.uri))?;
        }
        if self.app.poll_interval_ms == 0 {
            bail!("app.poll_interval_ms must be greater than zero");
        }
        if self.app.verifier_length == 0 {
            bail!("app.verifier_length must be between 1 and 128");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DeeptrackConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.spotify.authorize_url(),
            "https://accounts.spotify.com/authorize"
        );
        assert_eq!(
            config.spotify.token_url(),
            "https://accounts.spotify.com/api/token"
        );
        assert!(config.redirects.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: DeeptrackConfig = toml::from_str(
            r#"
[app]
poll_interval_ms = 2500

[[redirects]]
host_contains = "127.0.0.1"
uri = "http://127.0.0.1:8888/callback"
"#,
        )
        .unwrap();
        assert_eq!(config.app.poll_interval_ms, 2500);
        assert!(config.app.reauthorize_on_unauthorized);
        assert_eq!(config.spotify.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.redirects, vec![RedirectEntry {
            host_contains: "127.0.0.1".into(),
            uri: "http://127.0.0.1:8888/callback".into(),
        }]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DeeptrackConfig::default();
        config.app.location = "not a url".into();
        assert!(config.validate().is_err());

        let mut config = DeeptrackConfig::default();
        config.app.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DeeptrackConfig::default();
        config.spotify.client_id = " ".into();
        assert!(config.validate().is_err());
    }
}
