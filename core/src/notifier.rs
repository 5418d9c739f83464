//! Notifier sink interface (email/webhook/chat plug-ins are out of scope,
//! spec.md §1); this crate owns only the interface and a logging default so
//! call sites (§4.7: `signal`/`success`/`failure` job events) are real.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &str, payload: Value);
}

pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, event: &str, payload: Value) {
        tracing::info!(event, %payload, "notifier event");
    }
}
