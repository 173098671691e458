use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{HeaderMap, SET_COOKIE};
use reqwest::{redirect, Client, Error as ReqwestError, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub enum NetworkError {
    Reqwest(ReqwestError),
    ApiError { status: StatusCode, message: String },
    SerdeJsonError(serde_json::Error),
}

impl From<ReqwestError> for NetworkError {
    fn from(err: ReqwestError) -> NetworkError {
        NetworkError::Reqwest(err)
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> NetworkError {
        NetworkError::SerdeJsonError(err)
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Reqwest(e) => write!(f, "HTTP request error: {}", e),
            NetworkError::ApiError { status, message } => write!(f, "API error ({}): {}", status, message),
            NetworkError::SerdeJsonError(e) => write!(f, "JSON deserialization error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Reqwest(e) => Some(e),
            NetworkError::SerdeJsonError(e) => Some(e),
            NetworkError::ApiError { .. } => None,
        }
    }
}

/// A single request against the portal.
///
/// Only two shapes are ever needed: a plain GET and a form-encoded POST.
#[derive(Debug, Clone)]
pub struct PortalRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub form: Option<Vec<(String, String)>>,
    pub follow_redirects: bool,
}

impl PortalRequest {
    pub fn get(url: &str) -> Self {
        PortalRequest {
            method: Method::GET,
            url: url.to_string(),
            headers: HeaderMap::new(),
            form: None,
            follow_redirects: true,
        }
    }

    pub fn post_form(url: &str, form: Vec<(String, String)>) -> Self {
        PortalRequest {
            method: Method::POST,
            url: url.to_string(),
            headers: HeaderMap::new(),
            form: Some(form),
            follow_redirects: true,
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PortalResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl PortalResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// All `Set-Cookie` headers joined with ", ", or `None` when the server set no cookie.
    pub fn set_cookie(&self) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.status == StatusCode::FOUND
    }
}

/// Request in, response out. Cookies set by the server persist across calls.
/// Callers own any retry logic.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: PortalRequest) -> Result<PortalResponse, NetworkError>;
}

/// The live HTTP session: two clients sharing one cookie jar, one of which
/// never follows redirects.
pub struct PortalSession {
    following: Client,
    non_following: Client,
}

impl PortalSession {
    pub fn new(default_headers: HeaderMap) -> Result<Self, NetworkError> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let following = Client::builder()
            .default_headers(default_headers.clone())
            .cookie_provider(jar.clone())
            .build()?;
        let non_following = Client::builder()
            .default_headers(default_headers)
            .cookie_provider(jar)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(PortalSession { following, non_following })
    }
}

#[async_trait]
impl Transport for PortalSession {
    async fn send(&self, request: PortalRequest) -> Result<PortalResponse, NetworkError> {
        let client = if request.follow_redirects { &self.following } else { &self.non_following };

        let mut builder = client.request(request.method.clone(), &request.url).headers(request.headers);
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }
        debug!("[API] {} {} (follow redirects: {})", request.method, request.url, request.follow_redirects);

        let start_time = Instant::now();
        let response_result = builder.send().await;
        let duration = start_time.elapsed();
        info!("[TIMING] {} {} took {:.2?}", request.method, request.url, duration);

        let response = response_result?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        debug!("[API] {} returned {} ({} bytes)", request.url, status, body.len());

        Ok(PortalResponse { status, headers, body })
    }
}
