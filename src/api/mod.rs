//! HTTP client module for the Citus Cloud console.
//!
//! The console has no real API: role management goes through the same
//! HTML/JSON endpoints the browser uses, authenticated by session cookie.
//! `ConsoleClient` wraps that in a single authenticated-request primitive.

pub mod client;
pub mod error;
pub mod page;

pub use client::{ConsoleClient, CONSOLE_BASE_URL};
pub use error::ApiError;
