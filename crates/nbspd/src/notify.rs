//! A [`UiNotifier`] for headless hosts: every condition becomes a log line.

use nbsp_core::capability::UiNotifier;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl UiNotifier for LogNotifier {
    fn need_permissions(&self, port: u16) {
        tracing::warn!(port, "send permission not granted");
    }

    fn not_supported_network(&self) {
        tracing::warn!("network cannot carry NBS traffic");
    }

    fn send_failed(&self) {
        tracing::warn!("send failed");
    }

    fn version_mismatch(&self, app_id: &str, is_local_older: bool) {
        let older = if is_local_older { "local" } else { "remote" };
        tracing::warn!(app_id, older, "protocol version mismatch");
    }

    fn no_registered_recipient(&self, port: u16) {
        tracing::info!(port, "no app registered for port");
    }
}
