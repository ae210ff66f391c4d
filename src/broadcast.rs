//! Live fan-out of selected events to connected observers.
//!
//! Delivery is at-most-once and unbuffered: a sink that fails a write is
//! removed on the spot and never written to again. Observers that connect
//! later do not see earlier events.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::observability::dispatch_metrics;

/// One named event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub event: String,
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_wire(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
    #[error("sink is not keeping up")]
    Full,
}

/// A connected observer. Writes must not block.
pub trait StreamSink: Send + Sync {
    fn write(&self, frame: &Frame) -> Result<(), SinkError>;
}

/// Sink backed by a bounded channel, drained by the connection task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }
}

impl StreamSink for ChannelSink {
    fn write(&self, frame: &Frame) -> Result<(), SinkError> {
        self.tx.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SinkId(pub u64);

#[derive(Default)]
pub struct Broadcaster {
    sinks: Mutex<BTreeMap<SinkId, Arc<dyn StreamSink>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn StreamSink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, sink);
        debug!(sink = id.0, "Stream sink registered");
        id
    }

    pub fn unregister(&self, id: SinkId) -> bool {
        let removed = self
            .sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            debug!(sink = id.0, "Stream sink unregistered");
        }
        removed
    }

    /// Write `name`/`data` to every sink. Returns the number of successful writes.
    pub fn broadcast(&self, name: &str, data: serde_json::Value) -> usize {
        let frame = Frame::new(name, data);
        let mut delivered = 0;
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.retain(|id, sink| match sink.write(&frame) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(e) => {
                dispatch_metrics().record_sink_drop();
                warn!(sink = id.0, event = name, error = %e, "Dropping stream sink after failed write");
                false
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a channel-backed sink; the returned guard unregisters it when
    /// the connection goes away.
    pub fn subscribe(self: &Arc<Self>, capacity: usize) -> (SinkGuard, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.register(Arc::new(ChannelSink::new(tx)));
        (
            SinkGuard {
                broadcaster: Arc::clone(self),
                id,
            },
            rx,
        )
    }
}

/// Unregisters its sink on drop
pub struct SinkGuard {
    broadcaster: Arc<Broadcaster>,
    id: SinkId,
}

impl SinkGuard {
    pub fn id(&self) -> SinkId {
        self.id
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.broadcaster.unregister(self.id);
    }
}
