use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::str::FromStr;
use url::Url;

use crate::captcha::{fetch_and_solve, CaptchaError, CaptchaSolver};
use crate::config::Endpoints;
use crate::html_parser::{extract_login_tokens, LoginFormTokens};
use crate::network_client::{NetworkError, PortalRequest, PortalResponse, Transport};

/// Substring the login page carries when it wants a captcha.
pub const CAPTCHA_MARKER: &str = "验证码";
/// Substring of an already-expired `Set-Cookie`, sent back on a successful logout.
pub const EXPIRED_COOKIE_MARKER: &str = "01-Jan-1970";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identifier: String,
    secret: String,
}

impl Credentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Credentials { identifier: identifier.into(), secret: secret.into() }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Parses `"<identifier> <secret>"`, split on exactly one space.
impl FromStr for Credentials {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(' ').collect();
        match parts.as_slice() {
            [identifier, secret] if !identifier.is_empty() && !secret.is_empty() => {
                Ok(Credentials::new(*identifier, *secret))
            }
            _ => Err("expected \"<identifier> <secret>\" separated by a single space".to_string()),
        }
    }
}

#[derive(Debug)]
pub enum AuthError {
    LoginPageUnavailable { status: StatusCode },
    Network(NetworkError),
    Captcha(CaptchaError),
    Rejected { status: StatusCode },
    CaptchaBudgetExhausted { attempts: u32 },
    InvalidUrl(url::ParseError),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::LoginPageUnavailable { status } => {
                write!(f, "Failed to open login page ({}), check your Internet connection", status)
            }
            AuthError::Network(e) => write!(f, "Network error during login: {}", e),
            AuthError::Captcha(e) => write!(f, "Login captcha error: {}", e),
            AuthError::Rejected { status } => write!(f, "Login rejected ({}), check your account information", status),
            AuthError::CaptchaBudgetExhausted { attempts } => {
                write!(f, "Login still challenged after {} captcha attempts", attempts)
            }
            AuthError::InvalidUrl(e) => write!(f, "Invalid login URL: {}", e),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::Network(e) => Some(e),
            AuthError::Captcha(e) => Some(e),
            AuthError::InvalidUrl(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NetworkError> for AuthError {
    fn from(err: NetworkError) -> Self {
        AuthError::Network(err)
    }
}

impl From<url::ParseError> for AuthError {
    fn from(err: url::ParseError) -> Self {
        AuthError::InvalidUrl(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Init,
    PageFetched,
    TokensExtracted,
    Submitted,
    CaptchaChallenged,
    Success,
    Failed,
}

struct LoginFlow {
    state: LoginState,
}

impl LoginFlow {
    fn advance(&mut self, next: LoginState) {
        debug!("[login] {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: AuthError) -> AuthError {
        self.advance(LoginState::Failed);
        err
    }
}

/// Credentials, target service and the scraped hidden fields. Scraped fields win on a name clash.
pub fn build_login_payload(credentials: &Credentials, service: &str, tokens: LoginFormTokens) -> BTreeMap<String, String> {
    let mut payload = BTreeMap::from([
        ("username".to_string(), credentials.identifier.clone()),
        ("password".to_string(), credentials.secret.clone()),
        ("service".to_string(), service.to_string()),
    ]);
    payload.extend(tokens);
    payload
}

fn login_headers(login_url: &str) -> Result<HeaderMap, AuthError> {
    let origin = Url::parse(login_url)?.origin().unicode_serialization();
    let mut headers = HeaderMap::new();
    if let Ok(origin_val) = HeaderValue::from_str(&origin) {
        headers.insert(ORIGIN, origin_val);
    }
    if let Ok(referer_val) = HeaderValue::from_str(login_url) {
        headers.insert(REFERER, referer_val);
    }
    Ok(headers)
}

async fn submit_login<T: Transport + ?Sized>(
    transport: &T,
    url: &str,
    headers: &HeaderMap,
    payload: &BTreeMap<String, String>,
) -> Result<PortalResponse, NetworkError> {
    let form = payload.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let request = PortalRequest::post_form(url, form).headers(headers.clone()).no_redirects();
    let response = transport.send(request).await?;
    debug!("return status code {}", response.status);
    Ok(response)
}

/// Logs into the central authentication service.
///
/// Success is a 302 from the login POST. A non-302 carrying the captcha marker is
/// answered with a freshly solved captcha, at most `captcha_retries` times. A non-302
/// without the marker means the credentials were refused.
pub async fn login<T, S>(
    transport: &T,
    solver: &S,
    credentials: &Credentials,
    endpoints: &Endpoints,
    captcha_retries: u32,
) -> Result<(), AuthError>
where
    T: Transport + ?Sized,
    S: CaptchaSolver + ?Sized,
{
    let mut flow = LoginFlow { state: LoginState::Init };

    debug!("Initiating login page");
    let page = transport.send(PortalRequest::get(endpoints.login)).await.map_err(|e| flow.fail(e.into()))?;
    debug!("return status code {}", page.status);
    if page.status != StatusCode::OK {
        return Err(flow.fail(AuthError::LoginPageUnavailable { status: page.status }));
    }
    flow.advance(LoginState::PageFetched);

    let tokens = extract_login_tokens(&page.text());
    debug!("Extracted {} login form tokens", tokens.len());
    let mut payload = build_login_payload(credentials, endpoints.service, tokens);
    let headers = login_headers(endpoints.login).map_err(|e| flow.fail(e))?;
    flow.advance(LoginState::TokensExtracted);

    info!("Logging in as {}", credentials.identifier);
    let mut response =
        submit_login(transport, endpoints.login, &headers, &payload).await.map_err(|e| flow.fail(e.into()))?;
    flow.advance(LoginState::Submitted);

    let mut attempts = 0;
    loop {
        if response.is_redirect() {
            flow.advance(LoginState::Success);
            info!("Login succeeded");
            return Ok(());
        }
        if !response.text().contains(CAPTCHA_MARKER) {
            error!("Login failed with status {}, check your account information", response.status);
            return Err(flow.fail(AuthError::Rejected { status: response.status }));
        }
        if attempts >= captcha_retries {
            error!("Login failed, captcha retry budget of {} exhausted", captcha_retries);
            return Err(flow.fail(AuthError::CaptchaBudgetExhausted { attempts }));
        }
        attempts += 1;
        flow.advance(LoginState::CaptchaChallenged);
        warn!("Login requires a captcha (attempt {}/{})", attempts, captcha_retries);

        match fetch_and_solve(transport, solver, endpoints.login_captcha).await {
            Ok(code) => {
                payload.insert("captchaResponse".to_string(), code);
                response = submit_login(transport, endpoints.login, &headers, &payload)
                    .await
                    .map_err(|e| flow.fail(e.into()))?;
                flow.advance(LoginState::Submitted);
            }
            Err(e @ (CaptchaError::NoTextDetected | CaptchaError::LowConfidence { .. })) => {
                warn!("{}, fetching another captcha", e);
            }
            Err(e) => return Err(flow.fail(AuthError::Captcha(e))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutStatus {
    Confirmed,
    Anomalous,
}

/// Invalidates the remote session. Never fails: anything other than an expired
/// session cookie is logged as an anomaly.
pub async fn logout<T: Transport + ?Sized>(transport: &T, endpoints: &Endpoints) -> LogoutStatus {
    // not following the redirect: the expired cookie is set on the logout response itself
    let response = match transport.send(PortalRequest::get(endpoints.logout).no_redirects()).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Logout request failed: {}", e);
            return LogoutStatus::Anomalous;
        }
    };

    match response.set_cookie() {
        Some(cookie) if cookie.contains(EXPIRED_COOKIE_MARKER) => {
            info!("Logged out");
            LogoutStatus::Confirmed
        }
        other => {
            warn!("Logout anomaly: status {}, Set-Cookie {:?}", response.status, other);
            LogoutStatus::Anomalous
        }
    }
}

/// Logs out ahead of the session being dropped. The caller terminates the process afterwards.
pub async fn close<T: Transport + ?Sized>(transport: &T, endpoints: &Endpoints) -> LogoutStatus {
    let status = logout(transport, endpoints).await;
    info!("Session closed");
    status
}
