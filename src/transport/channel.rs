//! Persistent connection to the orchestration server
//!
//! [`TransportChannel`] owns one logical connection, dispatches inbound
//! events to per-kind subscribers and reconnects after unexpected closes
//! with a fixed backoff and a bounded number of retries. The network itself
//! sits behind [`Connector`] so the reconnect policy can be driven by tests.

use crate::transport::protocol::{ClientMessage, EventKind, Frame, ServerEvent};
use crate::{Result, SessionError};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Reconnection policy
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Reconnect attempts before giving up
    pub max_retries: u32,

    /// Fixed wait before each reconnect attempt, in milliseconds
    pub reconnect_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            reconnect_backoff_ms: 5000,
        }
    }
}

impl TransportConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

/// An open connection as a pair of frame queues.
///
/// Dropping `outgoing` asks the connector to close the connection; the
/// connector drops its end of `incoming` once the connection is gone.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<Frame>,
    pub incoming: mpsc::UnboundedReceiver<Frame>,
}

/// Opens connections to an address
pub trait Connector: Send + Sync {
    fn connect(&self, address: &str) -> BoxFuture<'static, Result<Link>>;
}

/// Lifecycle notifications delivered to status subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    /// Retries are exhausted; emitted once
    ConnectionFailed,
    /// A send was attempted while the connection was closed
    SendFailed { kind: &'static str },
    /// An inbound frame could not be parsed
    MalformedFrame(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(&ChannelStatus) + Send + Sync>;

/// Anything the coordinator can hand outbound messages to
pub trait Outbound: Send + Sync {
    fn send(&self, session_id: &str, message: &ClientMessage) -> Result<()>;

    /// Close for good; messages already handed over are still flushed
    fn close(&self);
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    address: Mutex<Option<String>>,
    state: Mutex<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>,
    status_handlers: RwLock<Vec<(SubscriptionId, StatusHandler)>>,
    next_subscription: AtomicU64,
    /// Bumped for every established connection and on disconnect, so a
    /// reader task from an older connection cannot act on the current one
    generation: AtomicU64,
    manually_disconnected: AtomicBool,
    reconnect_pending: AtomicBool,
    /// Bumped by `disconnect`; a retry armed under an older epoch is void
    reconnect_epoch: AtomicU64,
    retry_count: AtomicU32,
    failure_reported: AtomicBool,
}

/// Owned handle to the server connection. Cheap to clone.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<Inner>,
}

impl TransportChannel {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                address: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                handlers: RwLock::new(HashMap::new()),
                status_handlers: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                manually_disconnected: AtomicBool::new(false),
                reconnect_pending: AtomicBool::new(false),
                reconnect_epoch: AtomicU64::new(0),
                retry_count: AtomicU32::new(0),
                failure_reported: AtomicBool::new(false),
            }),
        }
    }

    /// Connect to `address` unless already connected or connecting
    pub async fn connect(&self, address: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Disconnected
                || self.inner.reconnect_pending.load(Ordering::SeqCst)
            {
                debug!("Connect ignored, channel is {:?}", *state);
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        *self.inner.address.lock() = Some(address.to_string());
        self.inner.manually_disconnected.store(false, Ordering::SeqCst);
        self.inner.failure_reported.store(false, Ordering::SeqCst);
        self.inner.retry_count.store(0, Ordering::SeqCst);

        Inner::establish(&self.inner).await
    }

    /// Close the connection and suppress any further reconnects
    pub fn disconnect(&self) {
        self.inner.manually_disconnected.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.reconnect_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.reconnect_pending.store(false, Ordering::SeqCst);

        let was = std::mem::replace(&mut *self.inner.state.lock(), ConnectionState::Disconnected);
        self.inner.outgoing.lock().take();

        if was == ConnectionState::Connected {
            info!("Disconnected from server");
            self.inner.emit_status(&ChannelStatus::Disconnected);
        }
    }

    /// Serialize and transmit a message.
    ///
    /// Fails with [`SessionError::ChannelClosed`] while the connection is not
    /// open; the message is dropped and status subscribers are told.
    pub fn send(&self, session_id: &str, message: &ClientMessage) -> Result<()> {
        let connected = *self.inner.state.lock() == ConnectionState::Connected;
        let sender = self.inner.outgoing.lock().clone();

        let delivered = match sender {
            Some(tx) if connected => {
                let text = message.to_envelope(session_id)?;
                tx.send(Frame::Text(text)).is_ok()
            }
            _ => false,
        };

        if delivered {
            debug!("Sent {}", message.kind());
            Ok(())
        } else {
            warn!("Dropping {} message, channel is closed", message.kind());
            self.inner.emit_status(&ChannelStatus::SendFailed {
                kind: message.kind(),
            });
            Err(SessionError::ChannelClosed(message.kind().to_string()))
        }
    }

    /// Register a handler for one message kind
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id();
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.write();
        match handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(existing, _)| *existing != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Register a handler for connection lifecycle changes
    pub fn subscribe_status<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ChannelStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_id();
        self.inner.status_handlers.write().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe_status(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.status_handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts made since the last successful connection
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }
}

impl Outbound for TransportChannel {
    fn send(&self, session_id: &str, message: &ClientMessage) -> Result<()> {
        TransportChannel::send(self, session_id, message)
    }

    fn close(&self) {
        self.disconnect();
    }
}

impl Inner {
    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst))
    }

    async fn establish(inner: &Arc<Inner>) -> Result<()> {
        let address = inner
            .address
            .lock()
            .clone()
            .ok_or_else(|| SessionError::ConfigError("No server address set".to_string()))?;

        *inner.state.lock() = ConnectionState::Connecting;
        debug!("Connecting to {}", address);

        match inner.connector.connect(&address).await {
            Ok(link) => {
                if inner.manually_disconnected.load(Ordering::SeqCst) {
                    *inner.state.lock() = ConnectionState::Disconnected;
                    return Err(SessionError::ChannelClosed(
                        "disconnected while connecting".to_string(),
                    ));
                }

                let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *inner.outgoing.lock() = Some(link.outgoing);
                *inner.state.lock() = ConnectionState::Connected;
                inner.retry_count.store(0, Ordering::SeqCst);

                info!("Connected to {}", address);
                inner.emit_status(&ChannelStatus::Connected);
                inner.spawn_reader(generation, link.incoming);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", address, e);
                *inner.state.lock() = ConnectionState::Disconnected;
                inner.schedule_reconnect();
                Err(e)
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, generation: u64, mut incoming: mpsc::UnboundedReceiver<Frame>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                if inner.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                inner.dispatch(&frame);
            }
            inner.handle_closed(generation);
        });
    }

    fn handle_closed(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            // Superseded or closed on purpose
            return;
        }

        *self.state.lock() = ConnectionState::Disconnected;
        self.outgoing.lock().take();

        warn!("Connection closed unexpectedly");
        self.emit_status(&ChannelStatus::Disconnected);

        if !self.manually_disconnected.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.manually_disconnected.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already in flight");
            return;
        }

        if self.retry_count.load(Ordering::SeqCst) >= self.config.max_retries {
            self.reconnect_pending.store(false, Ordering::SeqCst);
            if !self.failure_reported.swap(true, Ordering::SeqCst) {
                error!(
                    "Giving up after {} reconnect attempts",
                    self.config.max_retries
                );
                self.emit_status(&ChannelStatus::ConnectionFailed);
            }
            return;
        }

        let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            self.config.backoff(),
            attempt,
            self.config.max_retries
        );
        self.emit_status(&ChannelStatus::Reconnecting { attempt });

        let epoch = self.reconnect_epoch.load(Ordering::SeqCst);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.backoff()).await;

            if inner.reconnect_epoch.load(Ordering::SeqCst) != epoch
                || inner.manually_disconnected.load(Ordering::SeqCst)
            {
                debug!("Reconnect cancelled");
                return;
            }
            inner.reconnect_pending.store(false, Ordering::SeqCst);
            if let Err(e) = Inner::establish(&inner).await {
                debug!("Reconnect attempt {} failed: {}", attempt, e);
            }
        });
    }

    fn dispatch(&self, frame: &Frame) {
        let event = match ServerEvent::from_frame(frame) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("Dropping frame of unrecognized kind");
                return;
            }
            Err(e) => {
                warn!("Malformed frame: {}", e);
                self.emit_status(&ChannelStatus::MalformedFrame(e.to_string()));
                return;
            }
        };

        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(&event);
        }
    }

    fn emit_status(&self, status: &ChannelStatus) {
        let handlers: Vec<StatusHandler> = self
            .status_handlers
            .read()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            handler(status);
        }
    }
}
