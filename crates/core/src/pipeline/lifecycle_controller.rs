use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::capture::domain::frame_source::{CaptureError, FrameSourceProvider};
use crate::detection::domain::engine_factory::EngineFactory;
use crate::detection::domain::landmark_engine::EngineInitError;
use crate::pipeline::infrastructure::threaded_session::{self, SessionContext};
use crate::pipeline::pipeline_stats::PipelineStats;
use crate::pipeline::presentation::{PresentationSink, ResultPublisher};
use crate::shared::config::{ConfigError, LandmarkerConfig};
use crate::shared::release_error::ResourceReleaseError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Why a pipeline failed to reach [`PipelineState::Running`].
#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    EngineAsset(#[from] EngineInitError),
    #[error("camera unavailable: {0}")]
    Capture(#[from] CaptureError),
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("start was cancelled")]
    Cancelled,
    #[error("pipeline is already {0:?}")]
    AlreadyActive(PipelineState),
    #[error("pipeline did not start within {0:?}")]
    Timeout(Duration),
}

struct SessionStatus {
    state: PipelineState,
    failure: Option<InitError>,
    reached_running: bool,
}

/// State shared between the controller and its session thread.
pub(crate) struct SessionShared {
    status: Mutex<SessionStatus>,
    changed: Condvar,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(SessionStatus {
                state: PipelineState::Stopped,
                failure: None,
                reached_running: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn state(&self) -> PipelineState {
        self.lock().state
    }

    /// Moves `from -> to` only if the current state is `from`.
    pub(crate) fn transition(&self, from: PipelineState, to: PipelineState) -> bool {
        let mut status = self.lock();
        if status.state != from {
            return false;
        }
        log::info!("Pipeline {from:?} -> {to:?}");
        status.state = to;
        if to == PipelineState::Running {
            status.reached_running = true;
        }
        self.changed.notify_all();
        true
    }

    /// Records why startup failed. Everything the session acquired has been
    /// released by the time this is called.
    pub(crate) fn fail(&self, error: InitError) {
        let mut status = self.lock();
        status.failure = Some(error);
        status.state = PipelineState::Stopped;
        self.changed.notify_all();
    }

    fn begin_starting(&self) -> Result<(), PipelineState> {
        let mut status = self.lock();
        if status.state != PipelineState::Stopped {
            return Err(status.state);
        }
        status.state = PipelineState::Starting;
        status.failure = None;
        status.reached_running = false;
        self.changed.notify_all();
        Ok(())
    }

    /// Starting or Running become Stopping; returns the state seen.
    fn begin_stopping(&self) -> PipelineState {
        let mut status = self.lock();
        let seen = status.state;
        if matches!(seen, PipelineState::Starting | PipelineState::Running) {
            status.state = PipelineState::Stopping;
            self.changed.notify_all();
        }
        seen
    }

    fn finish_stopping(&self) {
        let mut status = self.lock();
        status.state = PipelineState::Stopped;
        self.changed.notify_all();
    }

    fn wait_until_running(&self, timeout: Option<Duration>) -> Result<(), InitError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = self.lock();
        loop {
            match status.state {
                PipelineState::Running => return Ok(()),
                PipelineState::Stopped | PipelineState::Stopping if status.reached_running => {
                    return Ok(())
                }
                PipelineState::Stopped => {
                    return Err(status.failure.take().unwrap_or(InitError::Cancelled))
                }
                PipelineState::Starting | PipelineState::Stopping => {}
            }
            status = match deadline {
                None => self
                    .changed
                    .wait(status)
                    .unwrap_or_else(|p| p.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(InitError::Timeout(timeout.unwrap_or_default()));
                    }
                    self.changed
                        .wait_timeout(status, deadline - now)
                        .unwrap_or_else(|p| p.into_inner())
                        .0
                }
            };
        }
    }
}

struct ActiveSession {
    handle: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
    publisher: Arc<ResultPublisher>,
}

/// Binds the camera and the inference pipeline to an explicit
/// attach/detach lifecycle.
///
/// Startup runs on a session thread: the engine is created, then the camera
/// is acquired, and the pipeline counts as running only once the first
/// frame has arrived. Either step may take a while; `attach` never waits for
/// them.
pub struct LifecycleController {
    config: LandmarkerConfig,
    factory: Arc<dyn EngineFactory>,
    provider: Arc<dyn FrameSourceProvider>,
    sink: Arc<dyn PresentationSink>,
    shared: Arc<SessionShared>,
    session: Mutex<Option<ActiveSession>>,
    stats: Mutex<Arc<PipelineStats>>,
}

impl LifecycleController {
    pub fn new(
        config: LandmarkerConfig,
        factory: Arc<dyn EngineFactory>,
        provider: Arc<dyn FrameSourceProvider>,
        sink: Arc<dyn PresentationSink>,
    ) -> Self {
        Self {
            config,
            factory,
            provider,
            sink,
            shared: Arc::new(SessionShared::new()),
            session: Mutex::new(None),
            stats: Mutex::new(Arc::new(PipelineStats::new())),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &LandmarkerConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Counters of the current (or most recent) session.
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    /// Begins asynchronous startup and returns immediately.
    pub fn attach(&self) -> Result<(), InitError> {
        self.config.validate()?;

        let mut session = self.lock_session();
        self.shared.begin_starting().map_err(InitError::AlreadyActive)?;

        // A session that ended on its own is still waiting to be joined.
        if let Some(previous) = session.take() {
            join_session(previous.handle);
        }

        let stats = Arc::new(PipelineStats::new());
        *self.stats.lock().unwrap_or_else(|p| p.into_inner()) = stats.clone();
        let publisher = Arc::new(ResultPublisher::new(self.sink.clone(), stats.clone()));
        let cancelled = Arc::new(AtomicBool::new(false));

        log::info!("Pipeline Stopped -> Starting ({:?} mode)", self.config.mode);
        let handle = threaded_session::spawn(SessionContext {
            config: self.config.clone(),
            factory: self.factory.clone(),
            provider: self.provider.clone(),
            publisher: publisher.clone(),
            stats,
            shared: self.shared.clone(),
            cancelled: cancelled.clone(),
        });

        *session = Some(ActiveSession {
            handle,
            cancelled,
            publisher,
        });
        Ok(())
    }

    /// Blocks until the pipeline is running or startup has failed.
    pub fn wait_until_running(&self, timeout: Duration) -> Result<(), InitError> {
        self.shared.wait_until_running(Some(timeout))
    }

    /// Attaches and waits for startup to finish.
    pub fn start(&self) -> Result<(), InitError> {
        self.attach()?;
        let outcome = self.shared.wait_until_running(None);
        if outcome.is_err() {
            // Reap the finished session thread.
            self.stop();
        }
        outcome
    }

    /// Tears the pipeline down. No update reaches the presentation sink
    /// once this returns. Calling it on a stopped pipeline does nothing.
    pub fn stop(&self) {
        let mut session = self.lock_session();
        let Some(active) = session.take() else {
            return;
        };

        let seen = self.shared.begin_stopping();
        log::debug!("Stopping pipeline from {seen:?}");
        active.cancelled.store(true, Ordering::Release);
        active.publisher.close();
        join_session(active.handle);
        self.shared.finish_stopping();
    }

    pub fn detach(&self) {
        self.stop();
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_session(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("{}", ResourceReleaseError::WorkerPanicked("session"));
    }
}
