use thiserror::Error;
#[derive(Debug, Error)]
pub enum AcqError {
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,
    #[error("invalid mux layout: {0}")]
    InvalidLayout(String),
    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("raw block shape mismatch: expected {expected:?}, got {actual:?}")]
    BlockShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("acquisition is already running")]
    AlreadyRunning,
    #[error("{0} thread panicked")]
    WorkerPanicked(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("failed to render plot: {0}")]
    Plot(String),
}
impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for AcqError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        AcqError::Plot(format!("{value:?}"))
    }
}
impl From<image::ImageError> for AcqError {
    fn from(value: image::ImageError) -> Self {
        AcqError::Plot(value.to_string())
    }
}
