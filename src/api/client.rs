//! Session-authenticated client for the Citus Cloud console.
//!
//! One `ConsoleClient` owns one HTTP session (cookie jar plus connection
//! pool) for one CLI invocation. Every operation funnels through the
//! `request` primitive, which transparently signs back in when the console
//! redirects to the sign-in page and persists the cookie jar after each
//! successful in-session response.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Method, Response, Url};
use serde_json::json;
use tracing::debug;

use crate::auth::cookie_file::CookieFile;
use crate::auth::flow::{self, check_status, Credentials};
use crate::auth::jar::SessionJar;
use crate::models::{CreateRoleResponse, FormationResponse, RoleInfo};

use super::error::ApiError;
use super::page;

/// Base URL of the Citus Cloud console.
pub const CONSOLE_BASE_URL: &str = "https://console.citusdata.com/";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Sign-in attempts per request before giving up. A persistent redirect to
/// the sign-in page after this many successful-looking sign-ins means the
/// account or console is misconfigured, not that a retry will help.
const MAX_AUTH_ATTEMPTS: u32 = 3;

const X_CSRF_TOKEN: HeaderName = HeaderName::from_static("x-csrf-token");

pub struct ConsoleClient {
    http: Client,
    jar: Arc<SessionJar>,
    base_url: Url,
    sign_in_url: Url,
    formations_url: Url,
    credentials: Credentials,
    cookie_file: Option<CookieFile>,
}

impl ConsoleClient {
    /// Build a client against `base_url`, loading a previously persisted
    /// session if `cookies_path_prefix` is given and the file exists.
    ///
    /// A cookie file that cannot be decrypted with the given credentials is
    /// an error, never a silently empty session.
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        cookies_path_prefix: Option<&str>,
    ) -> Result<Self, ApiError> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).map_err(|e| ApiError::InvalidUrl(format!("{base}: {e}")))?;
        let sign_in_url = join(&base_url, "users/sign_in")?;
        let formations_url = join(&base_url, "formations")?;

        let cookie_file = cookies_path_prefix
            .map(|prefix| CookieFile::new(format!("{prefix}{}", credentials.user)));

        let jar = Arc::new(SessionJar::new());
        if let Some(file) = &cookie_file {
            if let Some(cookies) =
                file.load(&credentials.password, &credentials.totp_secret)?
            {
                jar.restore(cookies);
            }
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .cookie_provider(jar.clone())
            .build()?;

        Ok(Self {
            http,
            jar,
            base_url,
            sign_in_url,
            formations_url,
            credentials,
            cookie_file,
        })
    }

    /// Verify that the account can sign in, priming the session cookies.
    pub async fn login(&self) -> Result<(), ApiError> {
        self.request(Method::GET, "formations", HeaderMap::new(), None)
            .await?;
        Ok(())
    }

    /// List the roles of a formation.
    pub async fn list_roles(&self, formation: &str) -> Result<Vec<RoleInfo>, ApiError> {
        let path = format!("formations/{formation}");
        // The console serves the JSON view only once the HTML page for the
        // formation has been rendered in this session.
        self.csrf_token(&path).await?;

        let response = self
            .request(Method::GET, &path, accept("application/json"), None)
            .await?;
        let formation: FormationResponse = response.json().await?;
        Ok(formation.roles)
    }

    /// Create a role named `name`; returns the new role's id.
    pub async fn create_role(&self, formation: &str, name: &str) -> Result<String, ApiError> {
        let path = format!("formations/{formation}/roles");
        let token = self.csrf_token(&path).await?;

        let mut headers = accept("application/json");
        headers.insert(X_CSRF_TOKEN, header_value(&token)?);

        let response = self
            .request(
                Method::POST,
                &path,
                headers,
                Some(json!({ "role_name": name })),
            )
            .await?;
        let created: CreateRoleResponse = response.json().await?;

        if created.id == "conflict" {
            return Err(ApiError::RoleAlreadyExists(name.to_string()));
        }
        if created.name.as_deref() != Some(name) {
            return Err(ApiError::InvalidResponse(format!(
                "created role is named {:?}, requested \"{}\"",
                created.name, name
            )));
        }
        Ok(created.id)
    }

    /// Delete the role with the given id.
    pub async fn delete_role(&self, formation: &str, id: &str) -> Result<(), ApiError> {
        let path = format!("formations/{formation}");
        let token = self.csrf_token(&path).await?;

        let mut headers = HeaderMap::new();
        headers.insert(X_CSRF_TOKEN, header_value(&token)?);

        self.request(
            Method::DELETE,
            &format!("{path}/roles/{id}"),
            headers,
            None,
        )
        .await?;
        Ok(())
    }

    /// Fetch the connection string for a role. The console serves it as the
    /// sole text node of the page body.
    pub async fn get_role_credentials(
        &self,
        formation: &str,
        id: &str,
    ) -> Result<String, ApiError> {
        let path = format!("formations/{formation}/roles/{id}/credentials");
        let response = self
            .request(Method::GET, &path, HeaderMap::new(), None)
            .await?;
        page::body_text(&response.text().await?)
    }

    /// Fetch the page at `path` as HTML and scrape its CSRF token. The token
    /// is only valid for the next mutating request and is never cached.
    async fn csrf_token(&self, path: &str) -> Result<String, ApiError> {
        let response = self
            .request(Method::GET, path, accept("text/html"), None)
            .await?;
        page::csrf_meta_token(&response.text().await?)
    }

    /// The authenticated-request primitive.
    ///
    /// Resolution of the final (post-redirect) URL:
    /// - the requested URL: in-session success; persist cookies and return,
    /// - the sign-in URL: run the sign-in flow and retry, at most
    ///   `MAX_AUTH_ATTEMPTS` times,
    /// - anything else: the console broke an assumption; give up.
    async fn request(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        json_body: Option<serde_json::Value>,
    ) -> Result<Response, ApiError> {
        let url = join(&self.base_url, path)?;
        let mut auth_attempts = 0u32;

        loop {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .headers(headers.clone());
            if let Some(body) = &json_body {
                request = request.json(body);
            }

            let response = check_status(request.send().await?).await?;

            if *response.url() == url {
                self.persist_cookies()?;
                return Ok(response);
            }

            if *response.url() == self.sign_in_url {
                auth_attempts += 1;
                if auth_attempts > MAX_AUTH_ATTEMPTS {
                    return Err(ApiError::AuthenticationFailed(MAX_AUTH_ATTEMPTS));
                }
                flow::sign_in(
                    &self.http,
                    &self.sign_in_url,
                    &self.formations_url,
                    &url,
                    &self.credentials,
                    response,
                )
                .await?;
                continue;
            }

            return Err(ApiError::UnexpectedRedirect(response.url().to_string()));
        }
    }

    /// Persist the jar after a fully successful in-session round trip. Never
    /// called from within the sign-in flow itself.
    fn persist_cookies(&self) -> Result<(), ApiError> {
        if let Some(file) = &self.cookie_file {
            file.save(
                &self.credentials.password,
                &self.credentials.totp_secret,
                &self.jar.snapshot(),
            )?;
            debug!(path = %file.path().display(), "persisted session cookies");
        }
        Ok(())
    }
}

fn join(base: &Url, path: &str) -> Result<Url, ApiError> {
    base.join(path)
        .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))
}

fn accept(mime: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(mime));
    headers
}

fn header_value(token: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(token)
        .map_err(|_| ApiError::InvalidResponse("csrf token is not a valid header value".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};
    use zeroize::Zeroizing;

    const TOTP_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    const SIGN_IN_FORM_PAGE: &str = r#"
        <html><head><meta name="csrf-token" content="form-tok"></head><body>
        <form id="new_user"><input type="hidden" name="authenticity_token" value="abc"></form>
        </body></html>"#;

    const CHALLENGE_PAGE: &str = r#"
        <html><head><meta name="csrf-token" content="otp-tok"></head><body>
        <div data-react-class="TwoFAWidget"></div>
        </body></html>"#;

    const CSRF_PAGE: &str =
        r#"<html><head><meta name="csrf-token" content="tok123"></head><body></body></html>"#;

    fn credentials() -> Credentials {
        Credentials {
            user: "alice@example.com".to_string(),
            password: Zeroizing::new("hunter2".to_string()),
            totp_secret: Zeroizing::new(TOTP_SECRET.to_string()),
        }
    }

    fn client(server: &MockServer, prefix: Option<&str>) -> ConsoleClient {
        ConsoleClient::new(&server.uri(), credentials(), prefix).unwrap()
    }

    /// Matches requests whose query string contains the given key.
    struct HasQueryKey(&'static str);

    impl wiremock::Match for HasQueryKey {
        fn matches(&self, request: &Request) -> bool {
            request.url.query_pairs().any(|(k, _)| k == self.0)
        }
    }

    /// Matches requests carrying the given fragment in their Cookie header.
    struct HasCookie(&'static str);

    impl wiremock::Match for HasCookie {
        fn matches(&self, request: &Request) -> bool {
            request
                .headers
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains(self.0))
        }
    }

    /// Register the whole sign-in exchange: form page, credential POST,
    /// challenge page, OTP POST granting the session cookie.
    async fn mount_sign_in_flow(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/users/sign_in"))
            .and(query_param("phase", "otp"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CHALLENGE_PAGE))
            .with_priority(1)
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/users/sign_in"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SIGN_IN_FORM_PAGE))
            .with_priority(10)
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/users/sign_in"))
            .and(HasQueryKey("user[email]"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/users/sign_in?phase=otp"),
            )
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/users/sign_in"))
            .and(HasQueryKey("user[otp_attempt]"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", "/formations")
                    .insert_header("Set-Cookie", "_session=ok; Path=/"),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn in_session_request_succeeds_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/cookies-", dir.path().display());
        let client = client(&server, Some(&prefix));

        client.login().await.unwrap();
        assert!(dir.path().join("cookies-alice@example.com").exists());
    }

    #[tokio::test]
    async fn redirect_to_sign_in_triggers_auth_and_retry() {
        let server = MockServer::start().await;
        mount_sign_in_flow(&server).await;

        Mock::given(method("GET"))
            .and(path("/formations"))
            .and(HasCookie("_session=ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/formations"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/users/sign_in"))
            .with_priority(10)
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/cookies-", dir.path().display());
        let client = client(&server, Some(&prefix));

        client.login().await.unwrap();

        // The freshly granted session cookie survives the encrypted file.
        let file = CookieFile::new(dir.path().join("cookies-alice@example.com"));
        let cookies = file.load("hunter2", TOTP_SECRET).unwrap().unwrap();
        assert!(cookies.iter().any(|c| c.name == "_session" && c.value == "ok"));
    }

    #[tokio::test]
    async fn unexpected_redirect_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/elsewhere"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/elsewhere"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = client(&server, None);
        let err = client.login().await.unwrap_err();
        match err {
            ApiError::UnexpectedRedirect(url) => assert!(url.ends_with("/elsewhere")),
            other => panic!("expected UnexpectedRedirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_two_factor_widget_is_protocol_violation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/users/sign_in"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/sign_in"))
            .and(query_param("phase", "otp"))
            // Bounced back to sign-in, but without the challenge widget.
            .respond_with(ResponseTemplate::new(200).set_body_string(CSRF_PAGE))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/sign_in"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SIGN_IN_FORM_PAGE))
            .with_priority(10)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/users/sign_in"))
            .and(HasQueryKey("user[email]"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/users/sign_in?phase=otp"),
            )
            .mount(&server)
            .await;

        let client = client(&server, None);
        let err = client.login().await.unwrap_err();
        match err {
            ApiError::UnexpectedRedirect(url) => assert!(url.contains("/users/sign_in")),
            other => panic!("expected UnexpectedRedirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn otp_landing_on_third_url_is_protocol_violation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/users/sign_in"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/sign_in"))
            .and(query_param("phase", "otp"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CHALLENGE_PAGE))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/sign_in"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SIGN_IN_FORM_PAGE))
            .with_priority(10)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/users/sign_in"))
            .and(HasQueryKey("user[email]"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/users/sign_in?phase=otp"),
            )
            .mount(&server)
            .await;
        // The OTP submission lands on neither the formations page nor the
        // originally requested URL.
        Mock::given(method("POST"))
            .and(path("/users/sign_in"))
            .and(HasQueryKey("user[otp_attempt]"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/dashboard"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dashboard"))
            .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
            .mount(&server)
            .await;

        let client = client(&server, None);
        let err = client.login().await.unwrap_err();
        match err {
            ApiError::UnexpectedRedirect(url) => assert!(url.ends_with("/dashboard")),
            other => panic!("expected UnexpectedRedirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persistent_sign_in_redirects_exhaust_attempts() {
        let server = MockServer::start().await;
        mount_sign_in_flow(&server).await;

        // Sign-in always "succeeds" (lands on /formations) but the original
        // request keeps bouncing back to the sign-in page.
        Mock::given(method("GET"))
            .and(path("/formations"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/formations/f1/roles/r1/credentials"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/users/sign_in"))
            .mount(&server)
            .await;

        let client = client(&server, None);
        let err = client.get_role_credentials("f1", "r1").await.unwrap_err();
        assert!(matches!(err, ApiError::AuthenticationFailed(3)));
    }

    #[tokio::test]
    async fn list_roles_projects_name_and_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations/f1"))
            .and(header("accept", "text/html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CSRF_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/formations/f1"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"roles":[{"name":"reporting","id":"r-1"},{"name":"etl","id":"r-2"}]}"#,
            ))
            .mount(&server)
            .await;

        let client = client(&server, None);
        let roles = client.list_roles("f1").await.unwrap();
        assert_eq!(
            roles,
            vec![
                RoleInfo { name: "reporting".into(), id: "r-1".into() },
                RoleInfo { name: "etl".into(), id: "r-2".into() },
            ]
        );
    }

    #[tokio::test]
    async fn create_role_returns_new_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations/f1/roles"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CSRF_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/formations/f1/roles"))
            .and(header("x-csrf-token", "tok123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"id":"r-9","name":"reporting"}"#),
            )
            .mount(&server)
            .await;

        let client = client(&server, None);
        let id = client.create_role("f1", "reporting").await.unwrap();
        assert_eq!(id, "r-9");
    }

    #[tokio::test]
    async fn create_role_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations/f1/roles"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CSRF_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/formations/f1/roles"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"id":"conflict"}"#))
            .mount(&server)
            .await;

        let client = client(&server, None);
        let err = client.create_role("f1", "reporting").await.unwrap_err();
        assert!(matches!(err, ApiError::RoleAlreadyExists(name) if name == "reporting"));
    }

    #[tokio::test]
    async fn create_role_name_mismatch_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations/f1/roles"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CSRF_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/formations/f1/roles"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"id":"r-9","name":"other"}"#),
            )
            .mount(&server)
            .await;

        let client = client(&server, None);
        let err = client.create_role("f1", "reporting").await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn delete_role_sends_csrf_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations/f1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CSRF_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/formations/f1/roles/r-1"))
            .and(header("x-csrf-token", "tok123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, None);
        client.delete_role("f1", "r-1").await.unwrap();
    }

    #[tokio::test]
    async fn role_credentials_are_the_trimmed_body_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations/f1/roles/r-1/credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body>\n  postgres://reporting:pw@db.example.com:5432/citus\n</body></html>",
            ))
            .mount(&server)
            .await;

        let client = client(&server, None);
        let creds = client.get_role_credentials("f1", "r-1").await.unwrap();
        assert_eq!(creds, "postgres://reporting:pw@db.example.com:5432/citus");
    }

    #[tokio::test]
    async fn malformed_credentials_page_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations/f1/roles/r-1/credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><div>postgres://creds</div></body></html>",
            ))
            .mount(&server)
            .await;

        let client = client(&server, None);
        let err = client.get_role_credentials("f1", "r-1").await.unwrap_err();
        assert!(matches!(err, ApiError::MalformedPage(_)));
    }

    #[tokio::test]
    async fn http_error_status_aborts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/formations"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = client(&server, None);
        assert!(matches!(
            client.login().await.unwrap_err(),
            ApiError::ServerError(_)
        ));
    }
}
