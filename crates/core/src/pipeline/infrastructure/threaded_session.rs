use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::capture::domain::frame_source::{CaptureError, FrameSource, FrameSourceProvider};
use crate::detection::domain::engine_factory::EngineFactory;
use crate::detection::domain::landmark_engine::{AsyncLandmarkEngine, LandmarkEngine};
use crate::detection::infrastructure::streaming_engine::StreamingEngine;
use crate::pipeline::backpressure::BackpressureStage;
use crate::pipeline::dispatch::{Dispatcher, EngineHandle};
use crate::pipeline::lifecycle_controller::{InitError, PipelineState, SessionShared};
use crate::pipeline::pipeline_stats::PipelineStats;
use crate::pipeline::presentation::ResultPublisher;
use crate::shared::config::{LandmarkerConfig, RunningMode};
use crate::shared::frame::Frame;
use crate::shared::release_error::ResourceReleaseError;

/// Transient capture errors tolerated in a row before the camera is
/// considered gone.
const MAX_CONSECUTIVE_CAPTURE_FAILURES: u32 = 30;

/// Everything a session thread needs, moved onto it at spawn.
pub(crate) struct SessionContext {
    pub config: LandmarkerConfig,
    pub factory: Arc<dyn EngineFactory>,
    pub provider: Arc<dyn FrameSourceProvider>,
    pub publisher: Arc<ResultPublisher>,
    pub stats: Arc<PipelineStats>,
    pub shared: Arc<SessionShared>,
    pub cancelled: Arc<AtomicBool>,
}

impl SessionContext {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Started {
    engine: Box<dyn LandmarkEngine>,
    source: Box<dyn FrameSource>,
    first: Frame,
}

/// Runs one pipeline session on a dedicated thread.
///
/// Layout: `session [init → capture → backpressure] → engine worker →
/// result thread → presentation`
///
/// In single-shot mode there is no engine worker or result thread; the
/// session thread runs inference itself between frames.
pub(crate) fn spawn(ctx: SessionContext) -> JoinHandle<()> {
    std::thread::spawn(move || run(ctx))
}

fn run(ctx: SessionContext) {
    let started = match initialize(&ctx) {
        Ok(started) => started,
        Err(InitError::Cancelled) => {
            log::info!("Pipeline start cancelled");
            ctx.shared.fail(InitError::Cancelled);
            return;
        }
        Err(e) => {
            log::error!("Pipeline failed to start: {e}");
            ctx.shared.fail(e);
            return;
        }
    };

    let Started {
        engine,
        mut source,
        first,
    } = started;

    if !ctx.shared.transition(PipelineState::Starting, PipelineState::Running) {
        // stop() got in between the first frame and now
        drop(first);
        close_source(source.as_mut());
        drop(engine);
        ctx.shared.fail(InitError::Cancelled);
        return;
    }
    ctx.stats.mark_started();

    match ctx.config.mode {
        RunningMode::Streaming => run_streaming(&ctx, engine, source.as_mut(), first),
        RunningMode::SingleShot => run_single_shot(&ctx, engine, source.as_mut(), first),
    }

    ctx.publisher.close();
    ctx.shared.transition(PipelineState::Running, PipelineState::Stopping);
    ctx.stats.log_summary();
    ctx.shared.transition(PipelineState::Stopping, PipelineState::Stopped);
}

/// Brings up the engine, then the camera, then waits for the first frame.
/// On failure everything acquired so far is released before returning.
fn initialize(ctx: &SessionContext) -> Result<Started, InitError> {
    let engine = ctx.factory.create(&ctx.config)?;
    log::info!("Landmark engine ready");

    if ctx.is_cancelled() {
        return Err(InitError::Cancelled);
    }

    let mut source = match ctx.provider.acquire(&ctx.cancelled) {
        Ok(source) => source,
        Err(CaptureError::Cancelled) => return Err(InitError::Cancelled),
        Err(e) => return Err(e.into()),
    };
    log::info!("Camera acquired");

    match first_frame(source.as_mut(), &ctx.cancelled) {
        Ok(first) => Ok(Started {
            engine,
            source,
            first,
        }),
        Err(e) => {
            close_source(source.as_mut());
            Err(e)
        }
    }
}

/// The camera counts as available once it has actually produced a frame.
fn first_frame(source: &mut dyn FrameSource, cancelled: &AtomicBool) -> Result<Frame, InitError> {
    let mut failures = 0;
    loop {
        if cancelled.load(Ordering::Acquire) {
            return Err(InitError::Cancelled);
        }
        match source.next_frame() {
            Some(Ok(frame)) => return Ok(frame),
            Some(Err(e)) if e.is_transient() && failures < MAX_CONSECUTIVE_CAPTURE_FAILURES => {
                log::warn!("Waiting for a usable first frame: {e}");
                failures += 1;
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(CaptureError::NoFrames.into()),
        }
    }
}

fn run_streaming(
    ctx: &SessionContext,
    engine: Box<dyn LandmarkEngine>,
    source: &mut dyn FrameSource,
    first: Frame,
) {
    let (streaming, events) = StreamingEngine::new(engine);
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let timeout = ctx.config.dispatch_timeout();
    let dispatcher = Dispatcher::new(
        EngineHandle::Streaming(&streaming),
        timeout,
        &ctx.publisher,
        &ctx.stats,
    );

    std::thread::scope(|scope| {
        let results = scope.spawn(|| dispatcher.run_result_loop(&events, &shutdown_rx));

        capture_loop(ctx, &dispatcher, source, first);
        if !ctx.is_cancelled() && !dispatcher.slot().wait_idle(timeout) {
            log::warn!("Engine did not answer the last frame within {timeout:?}");
        }

        let _ = shutdown_tx.send(());
        if results.join().is_err() {
            log::error!("{}", ResourceReleaseError::WorkerPanicked("result"));
        }
    });

    if let Err(e) = streaming.close() {
        log::warn!("{e}");
    }
    // Answers for frames still queued when the result thread stopped.
    for event in events.try_iter() {
        log::debug!("Discarding engine event for {:?} after shutdown", event.timestamp());
        ctx.stats.late_result_discarded();
    }
}

fn run_single_shot(
    ctx: &SessionContext,
    mut engine: Box<dyn LandmarkEngine>,
    source: &mut dyn FrameSource,
    first: Frame,
) {
    {
        let dispatcher = Dispatcher::new(
            EngineHandle::single_shot(engine.as_mut()),
            ctx.config.dispatch_timeout(),
            &ctx.publisher,
            &ctx.stats,
        );
        capture_loop(ctx, &dispatcher, source, first);
    }
    engine.reset();
}

/// Feeds frames through backpressure until the source ends, the session is
/// cancelled or the camera fails for good. Closes the source on exit.
fn capture_loop(
    ctx: &SessionContext,
    dispatcher: &Dispatcher<'_>,
    source: &mut dyn FrameSource,
    first: Frame,
) {
    let stage = BackpressureStage::new(dispatcher);
    stage.submit(first);

    let mut consecutive_failures = 0;
    while !ctx.is_cancelled() {
        match source.next_frame() {
            None => {
                log::info!("Camera stream ended");
                break;
            }
            Some(Ok(frame)) => {
                consecutive_failures = 0;
                stage.submit(frame);
            }
            // pipeline still holds the camera's buffers; not the camera's fault
            Some(Err(e @ CaptureError::BufferExhausted(_))) => {
                stage.submit_captured(Err(e));
            }
            Some(Err(e)) if e.is_transient() => {
                stage.submit_captured(Err(e));
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_CAPTURE_FAILURES {
                    log::error!("Camera failed {consecutive_failures} frames in a row, stopping");
                    break;
                }
            }
            Some(Err(e)) => {
                log::error!("Camera stopped: {e}");
                ctx.stats.capture_failed();
                break;
            }
        }
    }

    close_source(source);
}

fn close_source(source: &mut dyn FrameSource) {
    if let Err(e) = source.close() {
        log::warn!("{e}");
    }
}
