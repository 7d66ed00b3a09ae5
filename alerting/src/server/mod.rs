//! Admin surface of the alerting service

pub mod http;

pub use http::{serve_admin, AdminState};
