//! Sign-in state machine for the console.
//!
//! Three steps, each gated on the previous one landing where the console is
//! expected to send us: submit credentials into the scraped sign-in form,
//! answer the second-factor challenge with the current TOTP code, and confirm
//! the final redirect. Any markup or redirect mismatch aborts the invocation;
//! there is no partial retry.

use std::collections::HashMap;

use reqwest::{Client, Response, Url};
use tracing::debug;
use zeroize::Zeroizing;

use crate::api::error::ApiError;
use crate::api::page;

use super::totp;

/// Console account credentials, as passed on the command line or environment.
pub struct Credentials {
    pub user: String,
    pub password: Zeroizing<String>,
    pub totp_secret: Zeroizing<String>,
}

/// Run the full sign-in exchange. `sign_in_page` is the response the console
/// served when it redirected the original request to the sign-in URL.
///
/// On success the session cookies in the client's jar are fresh and the
/// caller retries its original request.
pub async fn sign_in(
    http: &Client,
    sign_in_url: &Url,
    landing_url: &Url,
    original_url: &Url,
    credentials: &Credentials,
    sign_in_page: Response,
) -> Result<(), ApiError> {
    debug!(user = %credentials.user, "signing in to the console");

    // Step 1: credentials into the scraped form, hidden fields verbatim.
    let html = sign_in_page.text().await?;
    let mut params = page::hidden_form_fields(&html, page::SIGN_IN_FORM_ID)?;
    params.insert("user[email]".to_string(), credentials.user.clone());
    params.insert(
        "user[password]".to_string(),
        credentials.password.as_str().to_string(),
    );

    let response = http
        .post(sign_in_url.clone())
        .query(&params)
        .send()
        .await?;
    let response = check_status(response).await?;

    // The console bounces back to the sign-in URL (possibly with a query
    // string) to present the second-factor challenge.
    let landed = response.url().clone();
    if landed != *sign_in_url && !landed.as_str().starts_with(&format!("{sign_in_url}?")) {
        return Err(ApiError::UnexpectedRedirect(landed.to_string()));
    }

    let html = response.text().await?;
    if !page::has_two_factor_challenge(&html) {
        return Err(ApiError::UnexpectedRedirect(landed.to_string()));
    }

    // Step 2: current TOTP code plus the page's CSRF token.
    let token = page::csrf_meta_token(&html)?;
    let code = totp::code_now(&credentials.totp_secret)?;

    let mut params = HashMap::new();
    params.insert("user[otp_attempt]".to_string(), code);
    params.insert("authenticity_token".to_string(), token);

    debug!("submitting one-time password");
    let response = http
        .post(sign_in_url.clone())
        .query(&params)
        .send()
        .await?;
    let response = check_status(response).await?;

    // Step 3: the console lands on the default post-login page or straight on
    // the originally requested URL.
    let landed = response.url();
    if landed == landing_url || landed == original_url {
        debug!("signed in to the console");
        return Ok(());
    }
    Err(ApiError::UnexpectedRedirect(landed.to_string()))
}

/// Raise on non-success status, carrying a truncated body for diagnostics.
pub async fn check_status(response: Response) -> Result<Response, ApiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }
}
