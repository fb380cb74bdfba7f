//! Publish bus.
//!
//! Device sessions emit [`Message`]s through the [`Bus`] trait. The Zenoh
//! implementation publishes non-retained values with a plain `put` and
//! retained ones through a zenoh-ext advanced publisher that caches the last
//! sample for late subscribers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;
use zenoh::Session;
use zenoh_ext::{AdvancedPublisher, AdvancedPublisherBuilderExt, CacheConfig};

use meterlink_common::{Format, ZenohConfig, encode};

use crate::codec::Value;

/// One value on its way to the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Value,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            retain: false,
        }
    }

    pub fn retained(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            retain: true,
            ..Self::new(topic, payload)
        }
    }
}

/// Errors from the publish bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Bus transport error on '{key}': {message}")]
    Transport { key: String, message: String },
    #[error("Failed to open bus session: {0}")]
    Connect(String),
    #[error("Failed to encode payload for '{key}': {message}")]
    Encode { key: String, message: String },
}

/// A connected publish session shared by every device session.
pub trait Bus: Send + Sync + 'static {
    fn publish(&self, message: &Message) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Release the session. Called once, after every publisher has stopped.
    fn close(&self) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// Opens publish sessions.
pub trait BusConnector: Send + Sync + 'static {
    type Bus: Bus;

    fn connect(&self) -> impl Future<Output = Result<Self::Bus, BusError>> + Send;
}

/// Replace characters that are special or illegal inside a key chunk.
pub fn sanitize_chunk(chunk: &str) -> String {
    chunk
        .chars()
        .map(|c| match c {
            '*' | '$' | '#' | '?' | '/' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Topic root for one device: `<prefix><driver>/<serial>/`.
///
/// Every message of a session is this root followed by a topic suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic {
    root: String,
}

impl DeviceTopic {
    pub fn new(prefix: &str, driver: &str, serial: &str) -> Self {
        Self {
            root: format!("{}{}/{}/", prefix, driver, sanitize_chunk(serial)),
        }
    }

    pub fn topic(&self, suffix: &str) -> String {
        format!("{}{}", self.root, suffix)
    }

    pub fn root(&self) -> &str {
        &self.root
    }
}

/// Zenoh-backed bus.
pub struct ZenohBus {
    // Dropped before `session`.
    publishers: RwLock<HashMap<String, AdvancedPublisher<'static>>>,
    session: Arc<Session>,
    format: Format,
}

impl std::fmt::Debug for ZenohBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZenohBus")
            .field("zid", &self.session.zid())
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl ZenohBus {
    pub fn new(session: Arc<Session>, format: Format) -> Self {
        Self {
            publishers: RwLock::new(HashMap::new()),
            session,
            format,
        }
    }

    /// Number of retained-value publishers declared so far.
    pub async fn retained_count(&self) -> usize {
        self.publishers.read().await.len()
    }

    async fn ensure_publisher(&self, key: &str) -> Result<(), BusError> {
        if self.publishers.read().await.contains_key(key) {
            return Ok(());
        }

        let publisher: AdvancedPublisher<'_> = self
            .session
            .declare_publisher(key.to_string())
            .cache(CacheConfig::default().max_samples(1))
            .publisher_detection()
            .await
            .map_err(|e| BusError::Transport {
                key: key.to_string(),
                message: format!("Failed to declare publisher: {}", e),
            })?;

        // SAFETY: the publisher only borrows the session, which is held by the
        // `Arc` in `self` and outlives the map (field order).
        let publisher: AdvancedPublisher<'static> = unsafe { std::mem::transmute(publisher) };

        self.publishers
            .write()
            .await
            .insert(key.to_string(), publisher);
        tracing::debug!(key = %key, "Declared retained publisher");

        Ok(())
    }
}

impl Bus for ZenohBus {
    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        let key = &message.topic;
        let payload = encode(&message.payload, self.format).map_err(|e| BusError::Encode {
            key: key.clone(),
            message: e.to_string(),
        })?;

        let result = if message.retain {
            self.ensure_publisher(key).await?;
            let publishers = self.publishers.read().await;
            match publishers.get(key) {
                Some(publisher) => publisher.put(payload).await,
                None => self.session.put(key, payload).await,
            }
        } else {
            self.session.put(key, payload).await
        };

        result.map_err(|e| BusError::Transport {
            key: key.clone(),
            message: e.to_string(),
        })
    }

    async fn close(&self) -> Result<(), BusError> {
        self.publishers.write().await.clear();
        self.session
            .close()
            .await
            .map_err(|e| BusError::Transport {
                key: String::new(),
                message: format!("Failed to close session: {}", e),
            })
    }
}

/// Opens [`ZenohBus`] sessions from a [`ZenohConfig`].
#[derive(Debug, Clone)]
pub struct ZenohBusConnector {
    zenoh: ZenohConfig,
    format: Format,
}

impl ZenohBusConnector {
    pub fn new(zenoh: ZenohConfig, format: Format) -> Self {
        Self { zenoh, format }
    }
}

impl BusConnector for ZenohBusConnector {
    type Bus = ZenohBus;

    async fn connect(&self) -> Result<ZenohBus, BusError> {
        let session = meterlink_common::connect(&self.zenoh)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(ZenohBus::new(Arc::new(session), self.format))
    }
}
