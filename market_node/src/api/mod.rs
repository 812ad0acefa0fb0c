pub mod auth;
pub mod errors;
pub mod handlers;
pub mod rate_limiter;
pub mod server;
pub mod websocket;

pub use errors::{ApiError, ApiResult};
pub use server::{create_router, AppState, PaymentInfo};
