//! Per-canvas snapshot fan-out.
//!
//! One `watch` channel per canvas: O(1) publish regardless of subscriber
//! count, and a slow subscriber skips straight to the newest snapshot.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, trace};
use logos_canvas::{CanvasDocument, CanvasId};
use tokio::sync::watch;

use super::{SnapshotEvent, SnapshotStream, StoreError};

/// Snapshot channels, indexed by canvas.
#[derive(Default)]
pub struct SnapshotHub {
    channels: DashMap<CanvasId, watch::Sender<SnapshotEvent>>,
}

fn is_newer(current: &SnapshotEvent, doc: &CanvasDocument) -> bool {
    match current {
        Ok(existing) => doc.version > existing.version,
        Err(_) => true,
    }
}

impl SnapshotHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a committed document.
    ///
    /// Snapshots older than (or equal to) the one already held are ignored,
    /// so publish order between concurrent committers cannot regress readers.
    pub fn publish(&self, doc: Arc<CanvasDocument>) {
        let sender = self
            .channels
            .entry(doc.id.clone())
            .or_insert_with(|| watch::channel(Ok(doc.clone())).0);
        let sent = sender.send_if_modified(|current| {
            if is_newer(current, &doc) {
                *current = Ok(doc.clone());
                true
            } else {
                false
            }
        });
        trace!("Published {} v{} (delivered: {})", doc.id, doc.version, sent);
    }

    /// Push a channel error to every subscriber of `canvas`.
    pub fn publish_error(&self, canvas: &CanvasId, err: StoreError) {
        if let Some(sender) = self.channels.get(canvas) {
            debug!("Publishing error to {} subscriber(s) of {}: {}", sender.receiver_count(), canvas, err);
            sender.send_replace(Err(err));
        }
    }

    /// Subscribe to `canvas`, seeding the channel with `current` if it is new.
    pub fn subscribe(&self, current: Arc<CanvasDocument>) -> SnapshotStream {
        let canvas = current.id.clone();
        let sender = self
            .channels
            .entry(canvas.clone())
            .or_insert_with(|| watch::channel(Ok(current.clone())).0);
        sender.send_if_modified(|held| {
            if is_newer(held, &current) {
                *held = Ok(current.clone());
                true
            } else {
                false
            }
        });
        SnapshotStream::new(canvas, sender.subscribe())
    }

    /// Drop the channel for `canvas`; open streams end.
    pub fn close(&self, canvas: &CanvasId) {
        if self.channels.remove(canvas).is_some() {
            debug!("Closed snapshot channel for {}", canvas);
        }
    }

    pub fn subscriber_count(&self, canvas: &CanvasId) -> usize {
        self.channels
            .get(canvas)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos_canvas::{NewShape, ShapeWrite};

    fn doc(version: u64) -> Arc<CanvasDocument> {
        let mut d = CanvasDocument::empty(CanvasId::from("c"), 0);
        d.version = version;
        Arc::new(d)
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current() {
        let hub = SnapshotHub::new();
        let mut stream = hub.subscribe(doc(3));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.version, 3);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = SnapshotHub::new();
        let mut stream = hub.subscribe(doc(0));
        stream.next().await.unwrap().unwrap();

        let mut next = (*doc(0)).clone();
        let shape = NewShape::rectangle(0.0, 0.0, 1.0, 1.0).into_record("a", 1).unwrap();
        next.apply_writes(&[ShapeWrite::Append(shape)], 1).unwrap();
        hub.publish(Arc::new(next));

        let got = stream.next().await.unwrap().unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.shapes.len(), 1);
    }

    #[tokio::test]
    async fn test_older_snapshot_ignored() {
        let hub = SnapshotHub::new();
        let mut stream = hub.subscribe(doc(5));
        stream.next().await.unwrap().unwrap();

        hub.publish(doc(4));
        hub.publish(doc(6));
        let got = stream.next().await.unwrap().unwrap();
        assert_eq!(got.version, 6);
    }

    #[tokio::test]
    async fn test_error_then_close() {
        let hub = SnapshotHub::new();
        let canvas = CanvasId::from("c");
        let mut stream = hub.subscribe(doc(0));
        stream.next().await.unwrap().unwrap();
        assert_eq!(hub.subscriber_count(&canvas), 1);

        hub.publish_error(&canvas, StoreError::Unavailable("boom".into()));
        assert!(stream.next().await.unwrap().is_err());

        hub.close(&canvas);
        assert!(stream.next().await.is_none());
        assert_eq!(hub.subscriber_count(&canvas), 0);
    }
}
