mod auth;
mod client;

pub use auth::{AccessToken, AuthClient, AuthError};
pub use client::{ApiErrorClass, JobProgress, JobStatus, PanClient, PanError, RemoteFile};
