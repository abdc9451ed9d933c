//! The `Broker` seam: the Rust realization of spec.md §1's "broker-
//! abstracted" framing. [`Route`](crate::route::endpoint::Route) is
//! generic over this trait rather than hard-wiring `async_nats`, matching
//! the teacher's pattern of putting a trait exactly where a concrete
//! backend is swappable (`storage::factory`'s `ServerStorage`).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors surfaced directly to Route callers (spec.md §7,
/// Transport-failure). Pull-mode fetch timeouts are intentionally *not*
/// represented here — they are absorbed and retried by the pull loop
/// itself, never surfaced as an error.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("publish to {subject} failed: {source}")]
    Publish {
        subject: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("request to {subject} failed: {source}")]
    Request {
        subject: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("subscribe to {subject} failed: {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to ensure stream {name} exists: {source}")]
    EnsureStream {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to ensure durable consumer {consumer} on stream {stream}: {source}")]
    EnsureConsumer {
        stream: String,
        consumer: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("flush failed: {0}")]
    Flush(#[source] anyhow::Error),
    #[error("drain failed: {0}")]
    Drain(#[source] anyhow::Error),
}

/// One inbound message observed from the broker, with an ack handle the
/// callback is responsible for invoking — the Route itself never acks on
/// the callback's behalf (spec.md §4.5, "Acknowledgment").
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Bytes,
    pub reply_to: Option<String>,
    pub ack: Box<dyn AckHandle>,
}

/// Positive/negative acknowledgment for one delivered message. Core-NATS
/// (non-durable) push subscriptions have no ack concept; their messages
/// carry a no-op handle.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> anyhow::Result<()>;
    async fn nak_with_delay(&self, delay: Duration) -> anyhow::Result<()>;
}

/// No-op ack handle for ephemeral (non-durable) subscriptions, where
/// acknowledgment has no meaning at the transport level.
pub struct NoopAckHandle;

#[async_trait]
impl AckHandle for NoopAckHandle {
    async fn ack(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn nak_with_delay(&self, _delay: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A live push subscription: the broker drives delivery; callers pull one
/// message at a time from this handle.
#[async_trait]
pub trait PushSubscription: Send {
    async fn next(&mut self) -> Option<BrokerMessage>;
    async fn unsubscribe(&mut self) -> anyhow::Result<()>;
}

/// Broker-neutral transport seam. `Route` (C5) is generic over this trait;
/// `NatsBroker` is the only production implementation, backed by
/// `async_nats` (core NATS for ephemeral pub/sub, JetStream when a route's
/// `name`+`queue` select durable/stream semantics).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(), BrokerError>;
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;
    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, BrokerError>;
    async fn ensure_stream(&self, name: &str, subject: &str) -> Result<(), BrokerError>;
    /// Ensures a durable pull consumer named `consumer` exists on `stream`,
    /// applying the route's `max_ack_pending`/`ack_wait` overrides
    /// (spec.md §3/§6) when given. Called only for durable pull routes.
    async fn ensure_consumer(
        &self,
        stream: &str,
        consumer: &str,
        max_ack_pending: Option<i64>,
        ack_wait: Option<Duration>,
    ) -> Result<(), BrokerError>;
    async fn subscribe_push(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Box<dyn PushSubscription>, BrokerError>;
    /// Pulls up to `batch_size` messages from a durable consumer, waiting
    /// at most `wait` before returning whatever arrived (possibly zero —
    /// a fetch timeout is not an error, per spec.md §4.5/§7).
    async fn fetch_pull_batch(
        &self,
        stream: &str,
        consumer: &str,
        batch_size: usize,
        wait: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError>;
    async fn flush(&self) -> Result<(), BrokerError>;
    async fn drain(&self) -> Result<(), BrokerError>;
}

/// `async_nats`-backed broker. Core NATS handles ephemeral push/request;
/// JetStream is used only for durable/queue-grouped routes (spec.md §3's
/// `name ≠ null ∧ queue ≠ null` condition).
pub struct NatsBroker {
    client: parking_lot::RwLock<Option<async_nats::Client>>,
    jetstream: parking_lot::RwLock<Option<async_nats::jetstream::Context>>,
}

impl Default for NatsBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl NatsBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: parking_lot::RwLock::new(None),
            jetstream: parking_lot::RwLock::new(None),
        }
    }

    fn client(&self) -> Option<async_nats::Client> {
        self.client.read().clone()
    }

    fn jetstream(&self) -> Option<async_nats::jetstream::Context> {
        self.jetstream.read().clone()
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn connect(&self, url: &str) -> Result<(), BrokerError> {
        if self.client().is_some() {
            return Ok(());
        }
        let client = async_nats::connect(url).await.map_err(|e| BrokerError::Connect {
            url: url.to_string(),
            source: anyhow::Error::new(e),
        })?;
        let js = async_nats::jetstream::new(client.clone());
        *self.client.write() = Some(client);
        *self.jetstream.write() = Some(js);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        let client = self.client().ok_or_else(|| BrokerError::Publish {
            subject: subject.to_string(),
            source: anyhow::anyhow!("not connected"),
        })?;
        client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Publish {
                subject: subject.to_string(),
                source: anyhow::Error::new(e),
            })
    }

    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, BrokerError> {
        let client = self.client().ok_or_else(|| BrokerError::Request {
            subject: subject.to_string(),
            source: anyhow::anyhow!("not connected"),
        })?;
        let reply = client
            .request(subject.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Request {
                subject: subject.to_string(),
                source: anyhow::Error::new(e),
            })?;
        Ok(reply.payload)
    }

    async fn ensure_stream(&self, name: &str, subject: &str) -> Result<(), BrokerError> {
        let js = self.jetstream().ok_or_else(|| BrokerError::EnsureStream {
            name: name.to_string(),
            source: anyhow::anyhow!("not connected"),
        })?;
        js.get_or_create_stream(async_nats::jetstream::stream::Config {
            name: name.to_string(),
            subjects: vec![subject.to_string()],
            ..Default::default()
        })
        .await
        .map_err(|e| BrokerError::EnsureStream {
            name: name.to_string(),
            source: anyhow::Error::new(e),
        })?;
        Ok(())
    }

    async fn ensure_consumer(
        &self,
        stream: &str,
        consumer: &str,
        max_ack_pending: Option<i64>,
        ack_wait: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let js = self.jetstream().ok_or_else(|| BrokerError::EnsureConsumer {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            source: anyhow::anyhow!("not connected"),
        })?;
        let stream_handle = js.get_stream(stream).await.map_err(|e| BrokerError::EnsureConsumer {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            source: anyhow::Error::new(e),
        })?;
        stream_handle
            .get_or_create_consumer(
                consumer,
                async_nats::jetstream::consumer::pull::Config {
                    durable_name: Some(consumer.to_string()),
                    ack_policy: async_nats::jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: ack_wait.unwrap_or(Duration::from_secs(30)),
                    max_ack_pending: max_ack_pending.unwrap_or(1000),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::EnsureConsumer {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
                source: anyhow::Error::new(e),
            })?;
        Ok(())
    }

    async fn subscribe_push(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Box<dyn PushSubscription>, BrokerError> {
        let client = self.client().ok_or_else(|| BrokerError::Subscribe {
            subject: subject.to_string(),
            source: anyhow::anyhow!("not connected"),
        })?;

        let subscriber = if let Some(queue) = queue {
            client.queue_subscribe(subject.to_string(), queue.to_string()).await
        } else {
            client.subscribe(subject.to_string()).await
        }
        .map_err(|e| BrokerError::Subscribe {
            subject: subject.to_string(),
            source: anyhow::Error::new(e),
        })?;

        Ok(Box::new(NatsPushSubscription { subscriber }))
    }

    async fn fetch_pull_batch(
        &self,
        stream: &str,
        consumer: &str,
        batch_size: usize,
        wait: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let js = self.jetstream().ok_or_else(|| BrokerError::Subscribe {
            subject: stream.to_string(),
            source: anyhow::anyhow!("not connected"),
        })?;

        let stream_handle = js.get_stream(stream).await.map_err(|e| BrokerError::Subscribe {
            subject: stream.to_string(),
            source: anyhow::Error::new(e),
        })?;
        let consumer_handle: async_nats::jetstream::consumer::PullConsumer = stream_handle
            .get_consumer(consumer)
            .await
            .map_err(|e| BrokerError::Subscribe {
                subject: consumer.to_string(),
                source: anyhow::Error::new(e),
            })?;

        use futures_util::StreamExt;
        let mut messages = consumer_handle
            .fetch()
            .max_messages(batch_size)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| BrokerError::Subscribe {
                subject: consumer.to_string(),
                source: anyhow::Error::new(e),
            })?;

        let mut out = Vec::with_capacity(batch_size);
        while let Some(msg) = messages.next().await {
            let Ok(msg) = msg else { continue };
            let subject = msg.subject.to_string();
            let payload = msg.payload.clone();
            out.push(BrokerMessage {
                subject,
                payload,
                reply_to: msg.reply.as_ref().map(ToString::to_string),
                ack: Box::new(JetstreamAckHandle { msg }),
            });
        }
        Ok(out)
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        let client = self.client().ok_or_else(|| BrokerError::Flush(anyhow::anyhow!("not connected")))?;
        client.flush().await.map_err(|e| BrokerError::Flush(anyhow::Error::new(e)))
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        let client = self.client().ok_or_else(|| BrokerError::Drain(anyhow::anyhow!("not connected")))?;
        client.drain().await.map_err(|e| BrokerError::Drain(anyhow::Error::new(e)))
    }
}

struct NatsPushSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl PushSubscription for NatsPushSubscription {
    async fn next(&mut self) -> Option<BrokerMessage> {
        use futures_util::StreamExt;
        let msg = self.subscriber.next().await?;
        let subject = msg.subject.to_string();
        let reply_to = msg.reply.as_ref().map(ToString::to_string);
        Some(BrokerMessage {
            subject,
            payload: msg.payload,
            reply_to,
            ack: Box::new(NoopAckHandle),
        })
    }

    async fn unsubscribe(&mut self) -> anyhow::Result<()> {
        self.subscriber.unsubscribe().await?;
        Ok(())
    }
}

struct JetstreamAckHandle {
    msg: async_nats::jetstream::Message,
}

#[async_trait]
impl AckHandle for JetstreamAckHandle {
    async fn ack(&self) -> anyhow::Result<()> {
        self.msg.ack().await.map_err(|e| anyhow::anyhow!(e))
    }

    async fn nak_with_delay(&self, delay: Duration) -> anyhow::Result<()> {
        self.msg
            .ack_with(async_nats::jetstream::AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }
}
