//! Fixtures shared by the engine's unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use feedwire_core::frame::{self, Frame};
use feedwire_settings::EngineSettings;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::handler::{FeedData, PartialResult, Producer, producer_fn};

pub(crate) type Rx = mpsc::Receiver<Arc<String>>;

/// Connection with a roomy queue.
pub(crate) fn connection(cache: bool) -> (Arc<Connection>, Rx) {
    let (tx, rx) = mpsc::channel(64);
    (Arc::new(Connection::new(tx, None, cache)), rx)
}

pub(crate) fn settings(cache: bool) -> EngineSettings {
    EngineSettings {
        cache_enabled: cache,
        snapshot_memory: 8,
        log_frames: false,
    }
}

/// Every frame queued so far.
pub(crate) fn drain(rx: &mut Rx) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(text) = rx.try_recv() {
        frames.extend(frame::decode(&text).unwrap());
    }
    frames
}

/// Wait for the next frame.
pub(crate) async fn next_frame(rx: &mut Rx) -> Frame {
    let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("channel closed");
    frame::decode(&text).unwrap().remove(0)
}

/// In-memory collection behind a producer.
#[derive(Clone, Default)]
pub(crate) struct Store {
    items: Arc<Mutex<Vec<Value>>>,
    calls: Arc<AtomicUsize>,
}

impl Store {
    pub(crate) fn new(items: Vec<Value>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
            calls: Arc::default(),
        }
    }

    pub(crate) fn set(&self, items: Vec<Value>) {
        *self.items.lock() = items;
    }

    pub(crate) fn push(&self, item: Value) {
        self.items.lock().push(item);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Producer returning the whole collection, or a page of `count` items
    /// with the total length.
    pub(crate) fn producer(&self) -> Arc<dyn Producer> {
        let store = self.clone();
        producer_fn(move |_, count, _| {
            let _ = store.calls.fetch_add(1, Ordering::SeqCst);
            let items = store.items.lock().clone();
            async move {
                Ok(match count {
                    Some(count) => {
                        let total_length = items.len() as u64;
                        FeedData::Partial(PartialResult {
                            items: items.into_iter().take(count as usize).collect(),
                            total_length,
                        })
                    }
                    None => FeedData::Items(items),
                })
            }
        })
    }
}
