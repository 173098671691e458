use async_trait::async_trait;
use log::{debug, info};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::network_client::{NetworkError, PortalRequest, Transport};

const CHAR_WHITELIST: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug)]
pub enum CaptchaError {
    Fetch(NetworkError),
    NoTextDetected,
    LowConfidence { text: String, confidence: f32 },
    Engine(String),
    Io(std::io::Error),
}

impl std::fmt::Display for CaptchaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptchaError::Fetch(e) => write!(f, "Failed to fetch captcha image: {}", e),
            CaptchaError::NoTextDetected => write!(f, "No text detected in captcha image"),
            CaptchaError::LowConfidence { text, confidence } => {
                write!(f, "Low confidence captcha reading {:?} ({:.1}%)", text, confidence)
            }
            CaptchaError::Engine(msg) => write!(f, "OCR engine error: {}", msg),
            CaptchaError::Io(e) => write!(f, "IO error while running OCR: {}", e),
        }
    }
}

impl std::error::Error for CaptchaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptchaError::Fetch(e) => Some(e),
            CaptchaError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NetworkError> for CaptchaError {
    fn from(err: NetworkError) -> Self {
        CaptchaError::Fetch(err)
    }
}

impl From<std::io::Error> for CaptchaError {
    fn from(err: std::io::Error) -> Self {
        CaptchaError::Io(err)
    }
}

/// Image bytes in, recognised text out.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, image: &[u8]) -> Result<String, CaptchaError>;
}

/// Runs the `tesseract` executable in single-line mode over short alphanumeric captchas.
pub struct TesseractSolver {
    program: PathBuf,
    min_confidence: f32,
}

impl TesseractSolver {
    pub fn new(program: PathBuf, min_confidence: f32) -> Self {
        TesseractSolver { program, min_confidence }
    }
}

#[async_trait]
impl CaptchaSolver for TesseractSolver {
    async fn solve(&self, image: &[u8]) -> Result<String, CaptchaError> {
        let whitelist = format!("tessedit_char_whitelist={}", CHAR_WHITELIST);
        let mut child = Command::new(&self.program)
            .args(["stdin", "stdout", "--psm", "7", "-c", &whitelist, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(image).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(CaptchaError::Engine(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let (text, confidence) = parse_tsv(&tsv).ok_or(CaptchaError::NoTextDetected)?;
        debug!("OCR read {:?} with confidence {:.1}", text, confidence);
        judge(text, confidence, self.min_confidence)
    }
}

/// Accepts a reading whose confidence reaches `min_confidence`.
pub fn judge(text: String, confidence: f32, min_confidence: f32) -> Result<String, CaptchaError> {
    if confidence < min_confidence {
        return Err(CaptchaError::LowConfidence { text, confidence });
    }
    Ok(text)
}

/// Collapses tesseract TSV output into the recognised word text and its mean confidence.
///
/// Word rows are level 5 with a non-negative confidence; everything else is layout.
/// Returns `None` when no word survives.
pub fn parse_tsv(tsv: &str) -> Option<(String, f32)> {
    let mut text = String::new();
    let mut confidences = Vec::new();

    for line in tsv.lines().skip(1) {
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() < 12 || columns[0] != "5" {
            continue;
        }
        let Ok(confidence) = columns[10].trim().parse::<f32>() else {
            continue;
        };
        let word: String = columns[11].chars().filter(char::is_ascii_alphanumeric).collect();
        if confidence < 0.0 || word.is_empty() {
            continue;
        }
        text.push_str(&word);
        confidences.push(confidence);
    }

    if text.is_empty() {
        return None;
    }
    let mean = confidences.iter().sum::<f32>() / confidences.len() as f32;
    Some((text, mean))
}

/// Downloads a fresh captcha image from `url` through the session and solves it.
pub async fn fetch_and_solve<T, S>(transport: &T, solver: &S, url: &str) -> Result<String, CaptchaError>
where
    T: Transport + ?Sized,
    S: CaptchaSolver + ?Sized,
{
    let response = transport.send(PortalRequest::get(url)).await?;
    if !response.status.is_success() {
        return Err(CaptchaError::Fetch(NetworkError::ApiError {
            status: response.status,
            message: format!("Failed to fetch captcha image: {}", url),
        }));
    }
    let code = solver.solve(&response.body).await?;
    info!("Captcha recognised as {:?}", code);
    Ok(code)
}
