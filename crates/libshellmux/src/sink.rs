use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use shellmux_protocol::Event;

use crate::error::SessionError;

/// The consumer side: receives output batches and close notifications.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: Event) -> Result<(), SessionError>;
}

/// Sink backed by an unbounded tokio channel. Delivery fails once the
/// receiver has been dropped.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: Event) -> Result<(), SessionError> {
        self.tx.send(event).map_err(|_| SessionError::SinkUnavailable)
    }
}

/// Re-injectable slot holding the current consumer. Every controller gets a
/// clone at construction; swapping the consumer later is visible to all of
/// them without touching the controllers.
#[derive(Clone, Default)]
pub struct SinkHandle {
    inner: Arc<RwLock<Option<Arc<dyn EventSink>>>>,
}

impl SinkHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        let handle = Self::new();
        handle.attach(sink);
        handle
    }

    /// Install `sink` as the consumer, replacing any previous one.
    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(sink);
    }

    pub fn detach(&self) {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    /// Detach only if `sink` is still the installed consumer.
    pub fn detach_if(&self, sink: &Arc<dyn EventSink>) {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, sink)) {
            *slot = None;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn deliver(&self, event: Event) -> Result<(), SessionError> {
        let sink = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SessionError::SinkUnavailable)?;
        sink.deliver(event)
    }
}
