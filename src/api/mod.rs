//! REST API module

pub mod handlers;
pub mod identity;
pub mod models;
pub mod routes;

pub use identity::{MaybeOwner, OWNER_HEADER, Owner};
pub use routes::{AppState, UploadLimits, create_router};
