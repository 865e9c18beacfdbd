use thiserror::Error;

/// Failure taxonomy for backend interactions. Every variant is surfaced to the
/// user as a notice; none of them are fatal to the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("folder selection failed: {0}")]
    SelectionFailed(String),

    #[error("processing could not be started: {0}")]
    OperationFailed(String),

    #[error("progress stream error: {0}")]
    StreamError(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("could not fetch receipt list: {0}")]
    FetchListFailed(String),
}
