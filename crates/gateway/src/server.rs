use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::State,
        response::{IntoResponse, Json},
        routing::get,
    },
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use {
    campusline_broker::{Broker, ClientDriver},
    campusline_config::CampuslineConfig,
    campusline_whatsapp::WhatsAppDriver,
};

use crate::{events::events_handler, sessions::sessions_router, state::AppState};

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/events", get(events_handler))
        .nest("/api/sessions", sessions_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Wire the broker to the WhatsApp driver and serve until Ctrl-C/SIGTERM.
pub async fn start_gateway(config: &CampuslineConfig, bind: &str, port: u16) -> anyhow::Result<()> {
    let driver: Arc<dyn ClientDriver> = Arc::new(WhatsAppDriver::new(
        &config.sidecar,
        config.broker.address_suffix.clone(),
    ));
    let broker = Arc::new(Broker::new(&config.broker, &config.pairing, driver));
    let app = build_gateway_app(AppState::new(Arc::clone(&broker)));

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        addr = %listener.local_addr()?,
        auth_base_dir = %config.broker.resolved_auth_base_dir().display(),
        version = env!("CARGO_PKG_VERSION"),
        "campusline gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, tearing down sessions");
    broker.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "sessions": state.broker.registry().len(),
    }))
}
