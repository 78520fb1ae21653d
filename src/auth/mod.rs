//! Authentication for the console session.
//!
//! This module provides:
//! - `flow`: the sign-in state machine (credentials, then TOTP second factor)
//! - `totp`: RFC 6238 one-time-password generation
//! - `jar`: the inspectable session cookie jar
//! - `cookie_file`: encrypted at-rest persistence of the jar
//!
//! Cookies are encrypted under a key derived from the password and TOTP
//! secret, so the cache is only readable by someone who could sign in anyway.

pub mod cookie_file;
pub mod flow;
pub mod jar;
pub mod totp;

pub use cookie_file::{CookieFile, StoreError};
pub use flow::Credentials;
pub use jar::{SessionJar, StoredCookie};
