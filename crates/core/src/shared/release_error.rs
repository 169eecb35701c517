use thiserror::Error;

/// Failure while returning a resource during teardown.
///
/// Teardown always runs to completion, so these are logged by the caller
/// and never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceReleaseError {
    #[error("inference engine failed to shut down: {0}")]
    Engine(String),
    #[error("camera failed to close: {0}")]
    Capture(String),
    #[error("{0} camera buffer(s) still checked out at close")]
    OutstandingBuffers(usize),
    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
}
