pub mod client;
pub mod error;
pub mod models;
pub mod poller;

pub use {
    client::{Resource, SpotifyGateway},
    error::FetchError,
    models::{Artist, Paging, PlayerState, Profile, TimeRange, Track},
    poller::{PlayerFeed, PlayerPoller},
};
