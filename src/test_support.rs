use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, SET_COOKIE};
use reqwest::StatusCode;

use crate::captcha::{CaptchaError, CaptchaSolver};
use crate::network_client::{NetworkError, PortalRequest, PortalResponse, Transport};

pub(crate) fn ok_response(body: impl Into<Vec<u8>>) -> PortalResponse {
    response(StatusCode::OK, body)
}

pub(crate) fn response(status: StatusCode, body: impl Into<Vec<u8>>) -> PortalResponse {
    PortalResponse { status, headers: HeaderMap::new(), body: body.into() }
}

pub(crate) fn cookie_response(status: StatusCode, set_cookie: &'static str) -> PortalResponse {
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, HeaderValue::from_static(set_cookie));
    PortalResponse { status, headers, body: Vec::new() }
}

impl PortalRequest {
    pub(crate) fn form_value(&self, key: &str) -> Option<&str> {
        self.form.as_ref()?.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

// Per-URL response queues; the last response for a URL repeats once the queue drains.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<PortalResponse>>>,
    sent: Mutex<Vec<PortalRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, url: &str, response: PortalResponse) {
        let mut guard = self.routes.lock().expect("routes mutex poisoned");
        guard.entry(url.to_string()).or_default().push_back(response);
    }

    pub(crate) fn push_status(&self, url: &str, status: StatusCode, body: &str) {
        self.push(url, response(status, body.as_bytes().to_vec()));
    }

    pub(crate) fn sent(&self) -> Vec<PortalRequest> {
        self.sent.lock().expect("sent mutex poisoned").clone()
    }

    pub(crate) fn sent_to(&self, url: &str) -> Vec<PortalRequest> {
        self.sent().into_iter().filter(|r| r.url == url).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: PortalRequest) -> Result<PortalResponse, NetworkError> {
        let url = request.url.clone();
        self.sent.lock().expect("sent mutex poisoned").push(request);

        let mut guard = self.routes.lock().expect("routes mutex poisoned");
        let queue = guard.get_mut(&url).ok_or_else(|| NetworkError::ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("no scripted response for {}", url),
        })?;
        let next = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
        next.ok_or_else(|| NetworkError::ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("scripted responses for {} exhausted", url),
        })
    }
}

// Hands out queued answers, then falls back to a fixed one.
pub(crate) struct ScriptedSolver {
    answers: Mutex<VecDeque<Result<String, CaptchaError>>>,
    fallback: String,
    images: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedSolver {
    pub(crate) fn always(answer: &str) -> Self {
        Self { answers: Mutex::new(VecDeque::new()), fallback: answer.to_string(), images: Mutex::new(Vec::new()) }
    }

    pub(crate) fn with_answers(self, answers: Vec<Result<String, CaptchaError>>) -> Self {
        *self.answers.lock().expect("answers mutex poisoned") = answers.into();
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.images.lock().expect("images mutex poisoned").len()
    }

    pub(crate) fn images(&self) -> Vec<Vec<u8>> {
        self.images.lock().expect("images mutex poisoned").clone()
    }
}

#[async_trait]
impl CaptchaSolver for ScriptedSolver {
    async fn solve(&self, image: &[u8]) -> Result<String, CaptchaError> {
        self.images.lock().expect("images mutex poisoned").push(image.to_vec());
        let queued = self.answers.lock().expect("answers mutex poisoned").pop_front();
        queued.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}
