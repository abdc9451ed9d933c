//! `Envelope` — a thin wrapper over a broker message, scoped to the
//! lifetime of one subscriber callback invocation (spec.md §3, "Message
//! Envelope").

use std::time::Duration;

use confluo_core::Record;

use crate::route::broker::BrokerMessage;

/// One delivered message. The callback that receives an `Envelope` is
/// responsible for calling [`Envelope::ack`] on success or
/// [`Envelope::nak_with_delay`] on recoverable failure — the route layer
/// never acks on the callback's behalf (spec.md §4.5).
pub struct Envelope {
    inner: BrokerMessage,
}

impl Envelope {
    pub(crate) fn new(inner: BrokerMessage) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.inner.reply_to.as_deref()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.inner.payload
    }

    /// Decodes the payload as UTF-8 text. `None` if the payload is not
    /// valid UTF-8.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.inner.payload).ok()
    }

    /// Decodes the payload as a JSON key/value record. `None` if the
    /// payload is not a JSON object.
    #[must_use]
    pub fn record(&self) -> Option<Record> {
        serde_json::from_slice::<serde_json::Value>(&self.inner.payload)
            .ok()
            .and_then(|v| v.as_object().cloned())
    }

    pub async fn ack(&self) -> anyhow::Result<()> {
        self.inner.ack.ack().await
    }

    pub async fn nak_with_delay(&self, delay: Duration) -> anyhow::Result<()> {
        self.inner.ack.nak_with_delay(delay).await
    }
}
