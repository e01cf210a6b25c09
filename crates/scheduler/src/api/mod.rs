//! HTTP bridge between the scheduler and the resource-manager shim

pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::ApiError;
pub use handlers::ApiState;
pub use server::ApiServer;
