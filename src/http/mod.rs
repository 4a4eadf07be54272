pub mod auth;
pub mod routes;

pub use routes::{build_router, AppError};
