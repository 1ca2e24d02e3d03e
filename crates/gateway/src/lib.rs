//! HTTP gateway exposing the session broker: initialize, status, send,
//! disconnect and a live event stream.

pub mod error;
pub mod events;
pub mod server;
pub mod sessions;
pub mod state;

pub use {
    server::{build_gateway_app, start_gateway},
    state::AppState,
};
