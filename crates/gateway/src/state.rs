use std::sync::Arc;

use campusline_broker::Broker;

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
