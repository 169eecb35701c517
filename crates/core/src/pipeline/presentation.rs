use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::detection::domain::detection_result::{serialize_nanos, DetectionResult};
use crate::pipeline::pipeline_stats::PipelineStats;

/// What the presentation layer hears about one analyzed frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LandmarkUpdate {
    Detected(DetectionResult),
    #[serde(rename_all = "camelCase")]
    NoFace {
        #[serde(rename = "timestampNs", serialize_with = "serialize_nanos")]
        timestamp: Duration,
    },
}

impl LandmarkUpdate {
    pub fn timestamp(&self) -> Duration {
        match self {
            LandmarkUpdate::Detected(result) => result.timestamp,
            LandmarkUpdate::NoFace { timestamp } => *timestamp,
        }
    }
}

/// Fire-and-forget delivery to whatever renders the coordinates.
///
/// Implementations must never block; returns `false` when the update was
/// dropped.
pub trait PresentationSink: Send + Sync {
    fn deliver(&self, update: LandmarkUpdate) -> bool;
}

/// Hands updates to another thread over a bounded channel. When the reader
/// falls behind, new updates are dropped instead of queued.
pub struct ChannelPresentationSink {
    tx: Sender<LandmarkUpdate>,
}

impl ChannelPresentationSink {
    pub fn channel(capacity: usize) -> (Self, Receiver<LandmarkUpdate>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl PresentationSink for ChannelPresentationSink {
    fn deliver(&self, update: LandmarkUpdate) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Gate between the result path and the presentation sink.
///
/// `publish` delivers while holding the gate lock, so once `close` returns no
/// update can reach the sink until the gate is reopened.
pub struct ResultPublisher {
    sink: Arc<dyn PresentationSink>,
    open: Mutex<bool>,
    stats: Arc<PipelineStats>,
}

impl ResultPublisher {
    pub fn new(sink: Arc<dyn PresentationSink>, stats: Arc<PipelineStats>) -> Self {
        Self {
            sink,
            open: Mutex::new(true),
            stats,
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap_or_else(|p| p.into_inner()) = true;
    }

    pub fn close(&self) {
        *self.open.lock().unwrap_or_else(|p| p.into_inner()) = false;
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns whether the update reached the sink.
    pub fn publish(&self, update: LandmarkUpdate) -> bool {
        let open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        if !*open {
            log::debug!("Discarding update for {:?}: pipeline stopped", update.timestamp());
            self.stats.late_result_discarded();
            return false;
        }
        let delivered = self.sink.deliver(update);
        if delivered {
            self.stats.update_delivered();
        } else {
            self.stats.update_dropped();
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::domain::detection_result::Point2;

    fn no_face(ms: u64) -> LandmarkUpdate {
        LandmarkUpdate::NoFace {
            timestamp: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, rx) = ChannelPresentationSink::channel(1);

        assert!(sink.deliver(no_face(1)));
        assert!(!sink.deliver(no_face(2)));

        assert_eq!(rx.try_recv().unwrap(), no_face(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_tolerates_disconnected_reader() {
        let (sink, rx) = ChannelPresentationSink::channel(1);
        drop(rx);
        assert!(!sink.deliver(no_face(1)));
    }

    #[test]
    fn test_closed_publisher_delivers_nothing() {
        let (sink, rx) = ChannelPresentationSink::channel(4);
        let stats = Arc::new(PipelineStats::new());
        let publisher = ResultPublisher::new(Arc::new(sink), stats.clone());

        assert!(publisher.publish(no_face(1)));
        publisher.close();
        assert!(!publisher.publish(no_face(2)));

        assert_eq!(rx.try_iter().count(), 1);
        let s = stats.snapshot();
        assert_eq!(s.delivered, 1);
        assert_eq!(s.late_discarded, 1);
    }

    #[test]
    fn test_reopened_publisher_delivers_again() {
        let (sink, rx) = ChannelPresentationSink::channel(4);
        let publisher = ResultPublisher::new(Arc::new(sink), Arc::new(PipelineStats::new()));
        publisher.close();
        publisher.open();

        assert!(publisher.publish(no_face(3)));
        assert_eq!(rx.try_recv().unwrap(), no_face(3));
    }

    #[test]
    fn test_full_channel_counts_delivery_drop() {
        let (sink, _rx) = ChannelPresentationSink::channel(1);
        let stats = Arc::new(PipelineStats::new());
        let publisher = ResultPublisher::new(Arc::new(sink), stats.clone());

        publisher.publish(no_face(1));
        publisher.publish(no_face(2));

        assert_eq!(stats.snapshot().delivery_dropped, 1);
    }

    #[test]
    fn test_update_json_shape() {
        let detected = LandmarkUpdate::Detected(DetectionResult {
            nose: Some(Point2::new(0.5, 0.4)),
            left_iris: None,
            right_iris: None,
            timestamp: Duration::from_micros(1500),
            image_width: 640,
            image_height: 480,
        });
        let json = serde_json::to_value(&detected).unwrap();
        assert_eq!(json["type"], "detected");
        assert_eq!(json["timestampNs"], 1_500_000);
        assert!(json.get("leftIris").is_none());

        let json = serde_json::to_value(no_face(2)).unwrap();
        assert_eq!(json["type"], "noFace");
        assert_eq!(json["timestampNs"], 2_000_000);
    }
}
