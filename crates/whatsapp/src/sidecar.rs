//! WebSocket connection to one tenant's sidecar.
//!
//! A writer task drains outgoing frames; a reader task turns incoming frames
//! into [`DriverEvent`]s and resolves pending send requests by `request_id`.
//! When the socket closes the reader drops its event sender, which the broker
//! observes as the client going away.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    futures::{SinkExt, StreamExt},
    tokio::{
        net::TcpStream,
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
    tracing::{debug, info, warn},
};

use campusline_broker::{DriverEvent, Error, MediaMessage};

use crate::types::{GatewayMessage, SendErrorKind, SidecarMessage};

/// Delay between connection attempts while the sidecar boots.
const RETRY_DELAY: Duration = Duration::from_millis(500);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outcome reported by a `send_result` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SendOutcome {
    success: bool,
    message_id: Option<String>,
    error: Option<String>,
    error_kind: Option<SendErrorKind>,
}

#[derive(Default)]
struct Pending {
    sends: HashMap<String, oneshot::Sender<SendOutcome>>,
    logout: Option<oneshot::Sender<()>>,
}

/// Live connection to a sidecar.
pub struct SidecarConnection {
    tenant_id: String,
    write_tx: mpsc::UnboundedSender<GatewayMessage>,
    pending: Arc<Mutex<Pending>>,
    send_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SidecarConnection {
    /// Connect to the sidecar on `port`, retrying while it starts up.
    pub async fn connect(
        tenant_id: &str,
        port: u16,
        retries: u32,
        send_timeout: Duration,
        address_suffix: String,
        events: mpsc::Sender<DriverEvent>,
    ) -> anyhow::Result<Self> {
        let stream = connect_with_retry(tenant_id, port, retries).await?;
        let (mut sink, mut source) = stream.split();

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<GatewayMessage>();
        let writer_tenant = tenant_id.to_string();
        let writer = tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(tenant_id = %writer_tenant, error = %e, "failed to encode sidecar frame");
                        continue;
                    },
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!(tenant_id = %writer_tenant, error = %e, "sidecar write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader_pending = Arc::clone(&pending);
        let reader_tenant = tenant_id.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(tenant_id = %reader_tenant, error = %e, "sidecar read failed");
                        break;
                    },
                };
                let msg = match serde_json::from_str::<SidecarMessage>(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(tenant_id = %reader_tenant, error = %e, "unparseable sidecar frame");
                        continue;
                    },
                };
                if let Some(event) =
                    route_frame(&reader_tenant, &reader_pending, msg, &address_suffix)
                    && events.send(event).await.is_err()
                {
                    debug!(tenant_id = %reader_tenant, "event receiver gone");
                    break;
                }
            }
            // Dropping the waiters fails any request still in flight.
            let mut pending = reader_pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.sends.clear();
            pending.logout = None;
            info!(tenant_id = %reader_tenant, "sidecar connection closed");
        });

        Ok(Self {
            tenant_id: tenant_id.to_string(),
            write_tx,
            pending,
            send_timeout,
            reader,
            writer,
        })
    }

    /// Queue a frame without waiting for a reply.
    pub fn send(&self, msg: GatewayMessage) -> campusline_broker::Result<()> {
        self.write_tx
            .send(msg)
            .map_err(|_| Error::send_failed("sidecar connection closed"))
    }

    pub async fn send_text(&self, to: &str, text: &str) -> campusline_broker::Result<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = GatewayMessage::SendText {
            request_id: request_id.clone(),
            to: to.to_string(),
            text: text.to_string(),
        };
        let outcome = self.request(request_id, frame).await?;
        outcome_to_result(outcome, None)
    }

    pub async fn send_media(
        &self,
        to: &str,
        media: &MediaMessage,
    ) -> campusline_broker::Result<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = GatewayMessage::SendMedia {
            request_id: request_id.clone(),
            to: to.to_string(),
            url: media.url.clone(),
            caption: media.caption.clone(),
            media_type: media.kind,
        };
        let outcome = self.request(request_id, frame).await?;
        outcome_to_result(outcome, Some(&media.url))
    }

    /// Ask the sidecar to log the device out and wait for the acknowledgement.
    /// Callers bound the wait.
    pub async fn logout(&self) -> campusline_broker::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.lock_pending().logout = Some(tx);
        self.send(GatewayMessage::Logout)?;
        rx.await
            .map_err(|_| Error::send_failed("sidecar closed before confirming logout"))
    }

    /// Stop both connection tasks.
    pub fn close(&self) {
        debug!(tenant_id = %self.tenant_id, "closing sidecar connection");
        self.reader.abort();
        self.writer.abort();
        let mut pending = self.lock_pending();
        pending.sends.clear();
        pending.logout = None;
    }

    async fn request(
        &self,
        request_id: String,
        frame: GatewayMessage,
    ) -> campusline_broker::Result<SendOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock_pending().sends.insert(request_id.clone(), tx);

        if let Err(e) = self.send(frame) {
            self.lock_pending().sends.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::send_failed("sidecar connection closed")),
            Err(_) => {
                self.lock_pending().sends.remove(&request_id);
                Err(Error::send_failed(format!(
                    "no result from sidecar within {}s",
                    self.send_timeout.as_secs()
                )))
            },
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SidecarConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Resolve bookkeeping frames; return the rest as driver events.
fn route_frame(
    tenant_id: &str,
    pending: &Mutex<Pending>,
    msg: SidecarMessage,
    address_suffix: &str,
) -> Option<DriverEvent> {
    match msg {
        SidecarMessage::SendResult {
            request_id,
            success,
            message_id,
            error,
            error_kind,
        } => {
            let waiter = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .sends
                .remove(&request_id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(SendOutcome {
                        success,
                        message_id,
                        error,
                        error_kind,
                    });
                },
                None => debug!(tenant_id, request_id, "send result for unknown request"),
            }
            None
        },
        SidecarMessage::LoggedOut => {
            info!(tenant_id, "sidecar confirmed logout");
            if let Some(waiter) = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .logout
                .take()
            {
                let _ = waiter.send(());
            }
            None
        },
        SidecarMessage::Error { error } => {
            warn!(tenant_id, error, "sidecar error");
            None
        },
        other => other.into_driver_event(address_suffix),
    }
}

fn outcome_to_result(
    outcome: SendOutcome,
    media_url: Option<&str>,
) -> campusline_broker::Result<String> {
    if outcome.success {
        return outcome
            .message_id
            .ok_or_else(|| Error::send_failed("sidecar reported success without a message id"));
    }
    let message = outcome
        .error
        .unwrap_or_else(|| "sidecar reported failure".to_string());
    match (outcome.error_kind, media_url) {
        (Some(SendErrorKind::MediaFetch), Some(url)) => Err(Error::media_fetch_failed(url, message)),
        _ => Err(Error::send_failed(message)),
    }
}

async fn connect_with_retry(tenant_id: &str, port: u16, retries: u32) -> anyhow::Result<WsStream> {
    let url = format!("ws://127.0.0.1:{port}");
    let attempts = retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                info!(tenant_id, port, attempt, "connected to WhatsApp sidecar");
                return Ok(stream);
            },
            Err(e) => {
                debug!(tenant_id, port, attempt, error = %e, "sidecar not reachable yet");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            },
        }
    }

    Err(anyhow::anyhow!(
        "could not connect to sidecar on port {port} after {attempts} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        campusline_broker::MediaKind,
        tokio::net::TcpListener,
        tokio_tungstenite::accept_async,
    };

    /// A stand-in sidecar that answers every request from `respond`.
    async fn fake_sidecar(
        respond: fn(GatewayMessage) -> Vec<SidecarMessage>,
    ) -> (u16, JoinHandle<Vec<GatewayMessage>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(frame)) = ws.next().await {
                let Message::Text(text) = frame else {
                    continue;
                };
                let msg: GatewayMessage = serde_json::from_str(text.as_str()).unwrap();
                received.push(msg.clone());
                for reply in respond(msg) {
                    let json = serde_json::to_string(&reply).unwrap();
                    ws.send(Message::Text(json.into())).await.unwrap();
                }
            }
            received
        });
        (port, task)
    }

    async fn connect(port: u16) -> (SidecarConnection, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = SidecarConnection::connect(
            "school-1",
            port,
            3,
            Duration::from_secs(2),
            "@c.us".into(),
            tx,
        )
        .await
        .unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn login_produces_pairing_and_ready_events() {
        let (port, _server) = fake_sidecar(|msg| match msg {
            GatewayMessage::Login { .. } => vec![
                SidecarMessage::Qr {
                    qr: "2@abc".into(),
                },
                SidecarMessage::Connected {
                    phone_number: Some("919876543210:3@s.whatsapp.net".into()),
                    push_name: None,
                },
            ],
            _ => vec![],
        })
        .await;
        let (conn, mut rx) = connect(port).await;

        conn.send(GatewayMessage::Login {
            tenant_id: "school-1".into(),
        })
        .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            DriverEvent::PairingCode("2@abc".into())
        );
        assert_eq!(rx.recv().await.unwrap(), DriverEvent::Ready {
            address: "919876543210@c.us".into(),
            display_name: None,
        });
    }

    #[tokio::test]
    async fn send_results_are_correlated_by_request_id() {
        let (port, _server) = fake_sidecar(|msg| match msg {
            GatewayMessage::SendText { request_id, .. } => vec![SidecarMessage::SendResult {
                request_id,
                success: true,
                message_id: Some("wamid-1".into()),
                error: None,
                error_kind: None,
            }],
            GatewayMessage::SendMedia { request_id, .. } => vec![SidecarMessage::SendResult {
                request_id,
                success: false,
                message_id: None,
                error: Some("404".into()),
                error_kind: Some(SendErrorKind::MediaFetch),
            }],
            _ => vec![],
        })
        .await;
        let (conn, _rx) = connect(port).await;

        let id = conn.send_text("919876543210@c.us", "hi").await.unwrap();
        assert_eq!(id, "wamid-1");

        let err = conn
            .send_media("919876543210@c.us", &MediaMessage {
                url: "https://cdn.example.com/x.png".into(),
                caption: None,
                kind: MediaKind::Image,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaFetchFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn unanswered_send_times_out() {
        let (port, _server) = fake_sidecar(|_| vec![]).await;
        let (tx, _rx) = mpsc::channel(16);
        let conn = SidecarConnection::connect(
            "school-1",
            port,
            3,
            Duration::from_millis(100),
            "@c.us".into(),
            tx,
        )
        .await
        .unwrap();

        let err = conn.send_text("919876543210@c.us", "hi").await.unwrap_err();
        assert!(matches!(err, Error::SendFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn logout_waits_for_acknowledgement() {
        let (port, server) = fake_sidecar(|msg| match msg {
            GatewayMessage::Logout => vec![SidecarMessage::LoggedOut],
            _ => vec![],
        })
        .await;
        let (conn, _rx) = connect(port).await;

        conn.logout().await.unwrap();
        conn.close();
        drop(conn);
        let received = server.await.unwrap();
        assert_eq!(received, vec![GatewayMessage::Logout]);
    }

    #[tokio::test]
    async fn closed_socket_ends_event_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
        });
        let (_conn, mut rx) = connect(port).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn gives_up_after_retries() {
        let port = crate::process::allocate_port().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let err = SidecarConnection::connect(
            "school-1",
            port,
            2,
            Duration::from_secs(1),
            "@c.us".into(),
            tx,
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("after 2 attempts"), "{err}");
    }

    #[test]
    fn success_without_message_id_is_a_failure() {
        let err = outcome_to_result(
            SendOutcome {
                success: true,
                message_id: None,
                error: None,
                error_kind: None,
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SendFailed { .. }));
    }
}
