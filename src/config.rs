use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER, TE, USER_AGENT};
use std::path::PathBuf;
use std::time::Duration;

pub const UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:76.0) Gecko/20100101 Firefox/76.0";

/// Headers every request carries.
pub static BASE_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(UA));
    headers
});

/// Extra headers for the check-in submission.
pub static SAVE_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(REFERER, HeaderValue::from_static("https://zlapp.fudan.edu.cn/site/ncov/fudanDaily?from=history"));
    headers.insert(HeaderName::from_static("dnt"), HeaderValue::from_static("1"));
    headers.insert(TE, HeaderValue::from_static("Trailers"));
    headers
});

/// Fixed portal endpoints.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub login: &'static str,
    pub login_captcha: &'static str,
    pub logout: &'static str,
    pub service: &'static str,
    pub status: &'static str,
    pub checkin_captcha: &'static str,
    pub submit: &'static str,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            login: "https://uis.fudan.edu.cn/authserver/login?service=https://zlapp.fudan.edu.cn/site/ncov/fudanDaily",
            login_captcha: "https://uis.fudan.edu.cn/authserver/captcha.html",
            logout: "https://uis.fudan.edu.cn/authserver/logout?service=/authserver/login",
            service: "https://zlapp.fudan.edu.cn/site/ncov/fudanDaily",
            status: "https://zlapp.fudan.edu.cn/ncov/wap/fudan/get-info",
            checkin_captcha: "https://zlapp.fudan.edu.cn/backend/default/code",
            submit: "https://zlapp.fudan.edu.cn/ncov/wap/fudan/save",
        }
    }
}

/// Knobs for a single run, filled in from the command line.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub endpoints: Endpoints,
    pub login_retries: u32,
    pub checkin_retries: u32,
    pub checkin_backoff: Duration,
    pub tesseract: PathBuf,
    pub min_confidence: f32,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            endpoints: Endpoints::default(),
            login_retries: 10,
            checkin_retries: 10,
            checkin_backoff: Duration::from_millis(1500),
            tesseract: PathBuf::from("tesseract"),
            min_confidence: 0.0,
        }
    }
}
