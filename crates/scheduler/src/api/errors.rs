use core::error::Error;

use poem::http::StatusCode;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
    #[display("Scheduler is shutting down")]
    SchedulerStopped,
}

impl Error for ApiError {}

impl poem::error::ResponseError for ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::SchedulerStopped => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
