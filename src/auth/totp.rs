//! Time-based one-time password generation (RFC 6238).
//!
//! The console's second factor uses the default TOTP parameters:
//! SHA-1, 6 digits, 30 second time step, base32-encoded shared secret.

use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Time step in seconds
const TIME_STEP_SECS: u64 = 30;

/// Number of output digits
const DIGITS: u32 = 6;

#[derive(Error, Debug)]
pub enum TotpError {
    #[error("TOTP secret is not valid base32")]
    InvalidSecret,

    #[error("System clock is before the Unix epoch")]
    ClockSkew,
}

/// Generate the OTP code for the current system time.
pub fn code_now(secret: &str) -> Result<String, TotpError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| TotpError::ClockSkew)?;
    code_at(secret, now.as_secs())
}

/// Generate the OTP code for a given Unix timestamp.
pub fn code_at(secret: &str, unix_time: u64) -> Result<String, TotpError> {
    let key = decode_secret(secret)?;
    let counter = unix_time / TIME_STEP_SECS;

    let mut mac = HmacSha1::new_from_slice(&key).map_err(|_| TotpError::InvalidSecret)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    let code = binary % 10u32.pow(DIGITS);
    Ok(format!("{:0width$}", code, width = DIGITS as usize))
}

/// Decode a base32 secret, tolerating lowercase, whitespace and trailing padding
/// as authenticator apps commonly hand them out.
fn decode_secret(secret: &str) -> Result<Vec<u8>, TotpError> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| TotpError::InvalidSecret)
}
