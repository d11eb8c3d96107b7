//! `reveil-playback` — Spotify Web API implementation of the scheduler's
//! [`PlaybackClient`](reveil_scheduler::PlaybackClient) seam.

pub mod client;
pub mod token;

pub use client::SpotifyClient;
pub use token::{CachedToken, TokenCache};
