//! API client module for the market backend

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, RequestOptions};
pub use error::ApiError;
pub use transport::{ApiResponse, HttpTransport, Transport};
