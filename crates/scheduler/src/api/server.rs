use error_stack::Report;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::{get, post, Endpoint, EndpointExt, Route, Server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::errors::ApiError;
use super::handlers::{self, ApiState};

/// HTTP server for resource-manager callbacks, driver call polling and introspection
pub struct ApiServer {
    state: ApiState,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(state: ApiState, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    pub fn routes(state: ApiState) -> impl Endpoint {
        Route::new()
            .at("/api/v1/driver/registered", post(handlers::registered))
            .at("/api/v1/driver/disconnected", post(handlers::disconnected))
            .at("/api/v1/driver/offers", post(handlers::offers))
            .at("/api/v1/driver/rescind", post(handlers::rescind))
            .at("/api/v1/driver/status", post(handlers::status))
            .at("/api/v1/driver/calls", get(handlers::calls))
            .at("/api/v1/tasks", get(handlers::tasks))
            .at("/api/v1/queue", get(handlers::queue))
            .at("/healthz", get(handlers::healthz))
            .data(state)
            .with(Tracing)
    }

    /// Serves until the token is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = Self::routes(self.state);
        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
