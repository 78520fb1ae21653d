//! Session-authenticated management of Citus Cloud database roles.
//!
//! The console exposes no API, so this crate drives the same HTML/JSON
//! endpoints a browser would: scrape the sign-in form, answer the TOTP
//! challenge, and keep the resulting session cookies in an encrypted local
//! cache between invocations.

pub mod api;
pub mod auth;
pub mod cli;
pub mod models;
