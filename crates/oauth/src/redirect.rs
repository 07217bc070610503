use url::Url;

use crate::types::RedirectRule;

/// The allow-list shipped with the app: `ng serve`, `ng serve --ssl`, and the
/// GitHub Pages deployment.
pub fn default_rules() -> Vec<RedirectRule> {
    [
        ("127.0.0.1", "http://127.0.0.1:4200/callback"),
        ("localhost", "https://localhost:4200/callback"),
        (
            "github.io",
            "https://christianamirt.github.io/Deep-Track/callback",
        ),
    ]
    .into_iter()
    .filter_map(|(host, uri)| {
        Url::parse(uri).ok().map(|redirect_uri| RedirectRule {
            host_contains: host.to_string(),
            redirect_uri,
        })
    })
    .collect()
}

/// Map the current location to its registered redirect URI.
///
/// Returns `None` when no rule matches; the flow must not proceed in that case.
pub fn resolve_redirect_uri(location: &Url, rules: &[RedirectRule]) -> Option<Url> {
    let host = location.host_str()?;
    rules
        .iter()
        .find(|rule| host.contains(rule.host_contains.as_str()))
        .map(|rule| rule.redirect_uri.clone())
}
