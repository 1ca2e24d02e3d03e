//! [`ClientDriver`] backed by one WhatsApp Web sidecar process per tenant.

use std::{path::PathBuf, time::Duration};

use {
    async_trait::async_trait,
    campusline_broker::{
        ClientDriver, ClientHandle, DriverEvent, Error, MediaMessage, Result, StartRequest,
    },
    campusline_config::SidecarConfig,
    tokio::sync::{Mutex, mpsc},
    tracing::{info, warn},
};

use crate::{
    process::{SidecarLaunch, SidecarProcess, allocate_port, find_sidecar_dir, start_sidecar},
    sidecar::SidecarConnection,
    types::GatewayMessage,
};

/// Starts a dedicated sidecar for every tenant session.
pub struct WhatsAppDriver {
    sidecar_dir: Option<PathBuf>,
    node_binary: String,
    startup_grace: Duration,
    connect_retries: u32,
    send_timeout: Duration,
    address_suffix: String,
}

impl WhatsAppDriver {
    pub fn new(config: &SidecarConfig, address_suffix: impl Into<String>) -> Self {
        Self {
            sidecar_dir: config.dir.clone(),
            node_binary: config.node_binary.clone(),
            startup_grace: Duration::from_millis(config.startup_grace_ms),
            connect_retries: config.connect_retries,
            send_timeout: Duration::from_secs(config.send_timeout_secs),
            address_suffix: address_suffix.into(),
        }
    }
}

#[async_trait]
impl ClientDriver for WhatsAppDriver {
    async fn start(
        &self,
        request: StartRequest,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<Box<dyn ClientHandle>> {
        let tenant_id = request.tenant_id.as_str();
        let sidecar_dir = find_sidecar_dir(self.sidecar_dir.as_deref()).map_err(startup_error)?;
        let port = allocate_port().map_err(startup_error)?;

        let mut process = start_sidecar(SidecarLaunch {
            tenant_id: request.tenant_id.clone(),
            sidecar_dir,
            node_binary: self.node_binary.clone(),
            port,
            auth_dir: request.auth_dir.clone(),
            startup_grace: self.startup_grace,
        })
        .await
        .map_err(startup_error)?;

        let connection = match SidecarConnection::connect(
            tenant_id,
            process.port(),
            self.connect_retries,
            self.send_timeout,
            self.address_suffix.clone(),
            events,
        )
        .await
        {
            Ok(connection) => connection,
            Err(e) => {
                warn!(tenant_id, error = %e, "sidecar unreachable, stopping it");
                process.stop().await;
                return Err(startup_error(e));
            },
        };

        if let Err(e) = connection.send(GatewayMessage::Login {
            tenant_id: request.tenant_id.clone(),
        }) {
            connection.close();
            process.stop().await;
            return Err(Error::engine_startup(e));
        }

        info!(tenant_id, port = process.port(), "WhatsApp client started");
        Ok(Box::new(WhatsAppClient {
            tenant_id: request.tenant_id,
            connection,
            process: Mutex::new(Some(process)),
        }))
    }
}

fn startup_error(e: anyhow::Error) -> Error {
    Error::engine_startup(format!("{e:#}"))
}

/// One tenant's sidecar plus its connection.
struct WhatsAppClient {
    tenant_id: String,
    connection: SidecarConnection,
    process: Mutex<Option<SidecarProcess>>,
}

#[async_trait]
impl ClientHandle for WhatsAppClient {
    async fn send_text(&self, to: &str, text: &str) -> Result<String> {
        self.connection.send_text(to, text).await
    }

    async fn send_media(&self, to: &str, media: &MediaMessage) -> Result<String> {
        self.connection.send_media(to, media).await
    }

    async fn logout(&self) -> Result<()> {
        self.connection.logout().await
    }

    async fn destroy(&self) {
        self.connection.close();
        // Taking the process makes a second destroy a no-op.
        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            process.stop().await;
            info!(tenant_id = %self.tenant_id, "WhatsApp client destroyed");
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_sidecar_dir_is_engine_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let driver = WhatsAppDriver::new(
            &SidecarConfig {
                dir: Some(dir.path().join("absent")),
                ..Default::default()
            },
            "@c.us",
        );
        let (tx, _rx) = mpsc::channel(4);
        let err = driver
            .start(
                StartRequest {
                    tenant_id: "school-1".into(),
                    auth_dir: dir.path().join("auth/school-1"),
                },
                tx,
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::EngineStartupFailed { .. }), "{err}");
        assert!(err.to_string().contains("package.json"), "{err}");
    }

    #[tokio::test]
    async fn missing_node_is_engine_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let driver = WhatsAppDriver::new(
            &SidecarConfig {
                dir: Some(dir.path().to_path_buf()),
                node_binary: "campusline-no-such-node-binary".into(),
                ..Default::default()
            },
            "@c.us",
        );
        let (tx, _rx) = mpsc::channel(4);
        let err = driver
            .start(
                StartRequest {
                    tenant_id: "school-1".into(),
                    auth_dir: dir.path().join("auth/school-1"),
                },
                tx,
            )
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("required runtime"), "{err}");
    }
}
