use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use image::RgbImage;

use crate::detection::domain::landmark_engine::{
    AsyncLandmarkEngine, DetectionError, EngineEvent, LandmarkEngine,
};
use crate::shared::release_error::ResourceReleaseError;

enum Job {
    Detect { image: RgbImage, timestamp: Duration },
    Reject { timestamp: Duration, error: DetectionError },
}

/// Runs a synchronous engine on its own worker thread.
///
/// Submissions are queued FIFO and each produces exactly one event on the
/// receiver returned by [`StreamingEngine::new`]. A timestamp that does not
/// increase is answered with an error event, queued behind earlier work so
/// ordering holds.
pub struct StreamingEngine {
    jobs: Mutex<Option<Sender<Job>>>,
    last_timestamp: Mutex<Option<Duration>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingEngine {
    pub fn new(engine: Box<dyn LandmarkEngine>) -> (Self, Receiver<EngineEvent>) {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<EngineEvent>();
        let worker = spawn_worker(engine, job_rx, event_tx);
        (
            Self {
                jobs: Mutex::new(Some(job_tx)),
                last_timestamp: Mutex::new(None),
                worker: Mutex::new(Some(worker)),
            },
            event_rx,
        )
    }
}

impl AsyncLandmarkEngine for StreamingEngine {
    fn detect_async(&self, image: RgbImage, timestamp: Duration) -> Result<(), DetectionError> {
        let jobs = self.jobs.lock().map_err(|_| DetectionError::Closed)?;
        let Some(jobs) = jobs.as_ref() else {
            return Err(DetectionError::Closed);
        };

        let mut last = self
            .last_timestamp
            .lock()
            .map_err(|_| DetectionError::Closed)?;
        let job = match *last {
            Some(previous) if timestamp <= previous => Job::Reject {
                timestamp,
                error: DetectionError::NonMonotonicTimestamp {
                    previous,
                    current: timestamp,
                },
            },
            _ => {
                *last = Some(timestamp);
                Job::Detect { image, timestamp }
            }
        };

        jobs.send(job).map_err(|_| DetectionError::Closed)
    }

    fn close(&self) -> Result<(), ResourceReleaseError> {
        // Dropping the sender ends the worker loop once queued jobs drain.
        let sender = self
            .jobs
            .lock()
            .map(|mut jobs| jobs.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take());
        drop(sender);

        let handle = self
            .worker
            .lock()
            .map(|mut worker| worker.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take());
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| ResourceReleaseError::WorkerPanicked("inference")),
            None => Ok(()),
        }
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Streaming engine shutdown: {e}");
        }
    }
}

fn spawn_worker(
    mut engine: Box<dyn LandmarkEngine>,
    job_rx: Receiver<Job>,
    event_tx: Sender<EngineEvent>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for job in job_rx {
            let event = match job {
                Job::Detect { image, timestamp } => {
                    let (image_width, image_height) = image.dimensions();
                    match engine.detect(&image, timestamp) {
                        Ok(result) => EngineEvent::Result {
                            result,
                            image_width,
                            image_height,
                        },
                        Err(error) => EngineEvent::Error { timestamp, error },
                    }
                }
                Job::Reject { timestamp, error } => EngineEvent::Error { timestamp, error },
            };
            // Nobody listening any more; keep draining so close() can join.
            let _ = event_tx.send(event);
        }
        log::debug!("Inference worker exiting");
    })
}
