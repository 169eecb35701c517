use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::detection::domain::coordinate_extractor;
use crate::detection::domain::detection_result::DetectionResult;
use crate::detection::domain::landmark_engine::{
    AsyncLandmarkEngine, DetectionError, EngineEvent, LandmarkEngine,
};
use crate::pipeline::backpressure::InFlightSlot;
use crate::pipeline::pipeline_stats::PipelineStats;
use crate::pipeline::presentation::{LandmarkUpdate, ResultPublisher};
use crate::shared::frame::Frame;

/// The engine a dispatcher drives, borrowed from the session that owns it.
pub enum EngineHandle<'e> {
    /// `dispatch` runs inference on the calling thread.
    SingleShot(Mutex<&'e mut dyn LandmarkEngine>),
    /// `dispatch` only submits; results come back through `on_result`.
    Streaming(&'e dyn AsyncLandmarkEngine),
}

impl<'e> EngineHandle<'e> {
    pub fn single_shot(engine: &'e mut dyn LandmarkEngine) -> Self {
        EngineHandle::SingleShot(Mutex::new(engine))
    }
}

/// Hands admitted frames to the engine and turns engine events into
/// presentation updates.
pub struct Dispatcher<'e> {
    engine: EngineHandle<'e>,
    slot: InFlightSlot,
    publisher: &'e ResultPublisher,
    stats: &'e PipelineStats,
}

impl<'e> Dispatcher<'e> {
    pub fn new(
        engine: EngineHandle<'e>,
        dispatch_timeout: Duration,
        publisher: &'e ResultPublisher,
        stats: &'e PipelineStats,
    ) -> Self {
        Self {
            engine,
            slot: InFlightSlot::new(dispatch_timeout),
            publisher,
            stats,
        }
    }

    pub fn slot(&self) -> &InFlightSlot {
        &self.slot
    }

    pub fn stats(&self) -> &PipelineStats {
        self.stats
    }

    /// Sends an admitted frame to the engine. The caller must already hold
    /// the in-flight slot for it.
    ///
    /// The frame is converted to an upright RGB image and dropped right away,
    /// returning its camera buffer before inference starts.
    pub fn dispatch(&self, frame: Frame) {
        let timestamp = frame.timestamp();
        let converted = frame.to_rgb();
        drop(frame);
        self.stats.frame_dispatched();

        let image = match converted {
            Ok(image) => image,
            Err(e) => {
                let error = DetectionError::InvalidFrame(e.to_string());
                self.on_result(EngineEvent::Error { timestamp, error });
                return;
            }
        };

        match &self.engine {
            EngineHandle::SingleShot(engine) => {
                let (image_width, image_height) = image.dimensions();
                let outcome = {
                    let mut engine = engine.lock().unwrap_or_else(|p| p.into_inner());
                    engine.detect(&image, timestamp)
                };
                let event = match outcome {
                    Ok(result) => EngineEvent::Result {
                        result,
                        image_width,
                        image_height,
                    },
                    Err(error) => EngineEvent::Error { timestamp, error },
                };
                self.on_result(event);
            }
            EngineHandle::Streaming(engine) => {
                if let Err(error) = engine.detect_async(image, timestamp) {
                    // Rejected outright: no event will follow.
                    self.on_result(EngineEvent::Error { timestamp, error });
                }
            }
        }
    }

    /// Correlates an engine event with the in-flight request, frees the slot
    /// and publishes the outcome. Events for abandoned requests are dropped.
    pub fn on_result(&self, event: EngineEvent) {
        let timestamp = event.timestamp();
        let Some(request) = self.slot.complete(timestamp) else {
            log::warn!("Discarding late engine result for {timestamp:?}");
            self.stats.late_result_discarded();
            return;
        };
        self.stats.detection_completed(request.submitted_at.elapsed());

        let update = match event {
            EngineEvent::Result {
                result,
                image_width,
                image_height,
            } => match coordinate_extractor::extract(&result, image_width, image_height) {
                Some(detected) => LandmarkUpdate::Detected(detected),
                None => {
                    self.stats.no_face();
                    LandmarkUpdate::NoFace { timestamp }
                }
            },
            EngineEvent::Error { error, .. } => {
                log::error!("Detection failed for frame {}: {error}", request.sequence);
                self.stats.detection_failed();
                LandmarkUpdate::NoFace { timestamp }
            }
        };

        self.publisher.publish(update);
    }

    /// Drains engine events until the event channel closes or `shutdown`
    /// fires. Runs on the result thread in streaming mode.
    pub fn run_result_loop(&self, events: &Receiver<EngineEvent>, shutdown: &Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(events) -> event => match event {
                    Ok(event) => self.on_result(event),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        log::debug!("Result loop exiting");
    }
}

/// Analyzes one frame synchronously, outside any pipeline.
pub fn detect_once(
    engine: &mut dyn LandmarkEngine,
    frame: Frame,
) -> Result<Option<DetectionResult>, DetectionError> {
    let timestamp = frame.timestamp();
    let converted = frame.to_rgb();
    drop(frame);
    let image = converted.map_err(|e| DetectionError::InvalidFrame(e.to_string()))?;
    let (width, height) = image.dimensions();
    let raw = engine.detect(&image, timestamp)?;
    Ok(coordinate_extractor::extract(&raw, width, height))
}
