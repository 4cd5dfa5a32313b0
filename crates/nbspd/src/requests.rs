//! Requests from client apps: registration and outbound sends.

use nbsp_core::capability::SendAcks;
use nbsp_core::{Command, Frame, VersionCheck};
use tokio::task::JoinHandle;

use crate::relay::Relay;

/// Why an outbound send never reached the carrier.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("frame is missing `{0}`")]
    Malformed(&'static str),
    #[error("send permission not granted")]
    NeedPermissions,
    #[error("network cannot carry NBS traffic")]
    UnsupportedNetwork,
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("transport rejected the frame: {0}")]
    Transport(String),
}

/// What the carrier eventually reported for one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub sent: bool,
    pub delivered: bool,
}

impl Relay {
    /// Entry point for raw frames from client apps.
    pub async fn on_client_message(&self, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(frame) => self.on_client_frame(&frame).await,
            Err(e) => tracing::warn!(error = %e, "dropping malformed client frame"),
        }
    }

    pub async fn on_client_frame(&self, frame: &Frame) {
        let inner = &self.inner;
        let app_id = frame.app_id.as_deref().unwrap_or("unknown");

        let check = frame.version_check(&inner.version);
        if !check.is_compatible() {
            tracing::warn!(
                app_id,
                remote = frame.version.as_deref().unwrap_or("none"),
                local = %inner.version,
                ?check,
                "client protocol version mismatch"
            );
            inner
                .host
                .notifier
                .version_mismatch(app_id, check == VersionCheck::LocalOlder);
            return;
        }

        match frame.command {
            Command::Register => self.handle_register(frame).await,
            Command::Send => {
                // Failures are already logged and surfaced.
                let _ = self.submit_send(frame);
            }
            Command::AppLaunched | Command::PermissionsGranted | Command::Deliver => {
                tracing::warn!(app_id, command = ?frame.command, "unexpected command from client");
            }
        }
    }

    async fn handle_register(&self, frame: &Frame) {
        let inner = &self.inner;
        let Some(app_id) = frame.app_id.as_deref() else {
            tracing::warn!(port = frame.port, "registration without app id");
            return;
        };
        if frame.port == 0 {
            tracing::warn!(app_id, "registration without port");
            return;
        }
        if frame.port == inner.config.port {
            tracing::warn!(app_id, port = frame.port, "refusing registration for the proxy's own port");
            return;
        }

        inner.registry.register(frame.port, app_id).await;

        let response = Frame::registration_response(&inner.version, frame, nbsp_core::now_ms());
        if let Err(e) = inner.host.channel.deliver(app_id, &response) {
            tracing::warn!(app_id, port = frame.port, error = %e, "registration response not delivered");
        }
    }

    /// Check and hand one `Send` frame to the transport. On success the
    /// returned task resolves once the carrier has reported back.
    pub fn submit_send(&self, frame: &Frame) -> Result<JoinHandle<SendReport>, SendError> {
        let inner = &self.inner;
        let host = &inner.host;

        let (phone, port, data) = frame.require_data().map_err(|e| {
            tracing::warn!(error = %e, "dropping incomplete send request");
            match e {
                nbsp_core::wire::WireError::MissingField(field) => SendError::Malformed(field),
                _ => SendError::Malformed("payload"),
            }
        })?;

        if !host.permissions.has_permission(&inner.config.send_permission) {
            tracing::info!(port, permission = %inner.config.send_permission, "send refused, permission missing");
            host.notifier.need_permissions(port);
            return Err(SendError::NeedPermissions);
        }
        if !host.network.is_compatible_network() {
            tracing::info!(port, "send refused, incompatible network");
            host.notifier.not_supported_network();
            return Err(SendError::UnsupportedNetwork);
        }
        if data.len() > inner.config.max_payload {
            tracing::warn!(port, bytes = data.len(), max = inner.config.max_payload, "send refused, payload too large");
            host.notifier.send_failed();
            return Err(SendError::TooLarge {
                len: data.len(),
                max: inner.config.max_payload,
            });
        }

        let acks = match host.transport.send_frame(phone, port, data) {
            Ok(acks) => acks,
            Err(e) => {
                tracing::warn!(port, error = %e, "transport submission failed");
                host.notifier.send_failed();
                return Err(SendError::Transport(e.to_string()));
            }
        };
        tracing::debug!(port, bytes = data.len(), "handed to transport");

        Ok(tokio::spawn(self.clone().watch_acks(port, data.len(), acks)))
    }

    async fn watch_acks(self, port: u16, len: usize, acks: SendAcks) -> SendReport {
        let inner = &self.inner;
        let sent = acks.sent.await.unwrap_or(false);
        if !sent {
            tracing::warn!(port, "carrier did not accept frame");
            inner.tracker.record_failed(port);
            inner.host.notifier.send_failed();
            return SendReport {
                sent: false,
                delivered: false,
            };
        }
        inner.tracker.record_sent(port);
        inner.ledger.record(true, port, len);

        let delivered = acks.delivered.await.unwrap_or(false);
        if delivered {
            inner.tracker.record_delivered(port);
        }
        tracing::debug!(port, delivered, "send settled");
        SendReport { sent, delivered }
    }
}
