//! Latest-wins admission of captured frames.
//!
//! At most one frame is in flight to the engine. A frame that arrives while
//! the slot is taken is dropped on the spot, which releases its camera
//! buffer, so a slow engine never builds a queue or stalls capture.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::capture::domain::frame_source::CaptureError;
use crate::pipeline::dispatch::Dispatcher;
use crate::shared::frame::Frame;

/// The in-flight record for the one frame the engine is working on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectionRequest {
    pub timestamp: Duration,
    pub sequence: u64,
    pub submitted_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Busy,
    /// The held request outlived the dispatch timeout and is now abandoned.
    /// The engine still owns it, so the slot stays taken until it answers.
    Abandoned(DetectionRequest),
}

#[derive(Clone, Copy)]
struct Held {
    request: DetectionRequest,
    abandoned: bool,
}

/// Size-one in-flight slot with an atomic check-and-set.
///
/// The slot is released only when the engine answers, so the engine never
/// holds more than one submission no matter how slow it is.
pub struct InFlightSlot {
    current: Mutex<Option<Held>>,
    idle: Condvar,
    timeout: Duration,
}

impl InFlightSlot {
    pub fn new(timeout: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            idle: Condvar::new(),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Held>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claims the slot for a frame if it is free.
    ///
    /// A held request older than the timeout is marked abandoned (reported
    /// once) but keeps the slot: its answer frees it and is then discarded.
    pub fn try_begin(&self, timestamp: Duration, sequence: u64) -> Admission {
        let now = Instant::now();
        let mut current = self.lock();
        if let Some(held) = current.as_mut() {
            if !held.abandoned && now.duration_since(held.request.submitted_at) >= self.timeout {
                held.abandoned = true;
                return Admission::Abandoned(held.request);
            }
            return Admission::Busy;
        }
        *current = Some(Held {
            request: DetectionRequest {
                timestamp,
                sequence,
                submitted_at: now,
            },
            abandoned: false,
        });
        Admission::Accepted
    }

    /// Releases the slot if it is held for `timestamp`.
    ///
    /// Returns `None` for a result that does not match the in-flight request,
    /// or whose request was abandoned.
    pub fn complete(&self, timestamp: Duration) -> Option<DetectionRequest> {
        let mut current = self.lock();
        match *current {
            Some(held) if held.request.timestamp == timestamp => {
                *current = None;
                self.idle.notify_all();
                (!held.abandoned).then_some(held.request)
            }
            _ => None,
        }
    }

    /// The request still awaiting a result, if it has not been abandoned.
    pub fn in_flight(&self) -> Option<DetectionRequest> {
        let current = *self.lock();
        current
            .filter(|held| !held.abandoned)
            .map(|held| held.request)
    }

    pub fn is_busy(&self) -> bool {
        self.lock().is_some()
    }

    /// Blocks until the slot is free or `timeout` passes. Returns whether it
    /// became free.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .idle
            .wait_timeout_while(guard, timeout, |current| current.is_some())
            .unwrap_or_else(|p| p.into_inner());
        guard.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Dispatched,
    /// Dropped because a detection was already in flight.
    Dropped,
    CaptureFailed,
}

/// Capture-side entry point: admits at most one frame into the dispatcher.
pub struct BackpressureStage<'a, 'e> {
    dispatcher: &'a Dispatcher<'e>,
}

impl<'a, 'e> BackpressureStage<'a, 'e> {
    pub fn new(dispatcher: &'a Dispatcher<'e>) -> Self {
        Self { dispatcher }
    }

    /// Never blocks in streaming mode. In single-shot mode the accepted frame
    /// is analyzed on the calling thread.
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        let stats = self.dispatcher.stats();
        stats.frame_submitted();

        match self
            .dispatcher
            .slot()
            .try_begin(frame.timestamp(), frame.sequence())
        {
            Admission::Busy => {
                log::debug!(
                    "Dropping frame {} at {:?}: detection in flight",
                    frame.sequence(),
                    frame.timestamp()
                );
                stats.frame_dropped();
                drop(frame);
                SubmitOutcome::Dropped
            }
            Admission::Abandoned(stale) => {
                log::warn!(
                    "Abandoning detection for frame {} after {:?} without a result",
                    stale.sequence,
                    stale.submitted_at.elapsed()
                );
                stats.request_abandoned();
                stats.frame_dropped();
                drop(frame);
                SubmitOutcome::Dropped
            }
            Admission::Accepted => {
                self.dispatcher.dispatch(frame);
                SubmitOutcome::Dispatched
            }
        }
    }

    /// Like [`submit`](Self::submit), for a capture attempt that may have
    /// failed. Failures are logged and counted, never fatal.
    pub fn submit_captured(&self, captured: Result<Frame, CaptureError>) -> SubmitOutcome {
        match captured {
            Ok(frame) => self.submit(frame),
            Err(e) => {
                log::warn!("Dropping unusable camera frame: {e}");
                self.dispatcher.stats().capture_failed();
                SubmitOutcome::CaptureFailed
            }
        }
    }
}
