// Public API for the server binary, the client and integration tests

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod deck;
pub mod error;
pub mod protocol;
pub mod room_code;
pub mod rotation;
pub mod scoring;
pub mod state;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod ws;
