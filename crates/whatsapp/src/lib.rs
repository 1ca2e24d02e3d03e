//! WhatsApp Web client driver for the session broker.
//!
//! Each tenant gets its own Node.js sidecar (whatsapp-web automation) with a
//! private credential directory; the gateway talks to it over a localhost
//! WebSocket.

pub mod driver;
pub mod process;
pub mod sidecar;
pub mod types;

pub use {
    driver::WhatsAppDriver,
    process::{SIDECAR_DIR_ENV, find_sidecar_dir, has_node_modules, is_sidecar_built, resolve_node},
};
