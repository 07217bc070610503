pub mod callback_server;
pub mod error;
pub mod flow;
pub mod pkce;
pub mod redirect;
pub mod storage;
pub mod types;

pub use {
    callback_server::CallbackServer,
    error::{AuthError, Result},
    flow::{Navigator, OAuthFlow},
    storage::{FileStore, KeyValueStore, MemoryStore, TokenStore},
    types::{AuthState, OAuthConfig, PkceChallenge, RedirectRule, TokenRecord},
};
