mod auth;
mod captcha;
mod checkin;
mod config;
mod html_parser;
mod network_client;
mod utils;
mod workflow;

#[cfg(test)]
mod test_support;

use clap::Parser;
use log::{error, info};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use crate::auth::Credentials;
use crate::captcha::TesseractSolver;
use crate::config::{RunConfig, BASE_HEADERS};
use crate::network_client::PortalSession;
use crate::workflow::RunOutcome;

#[derive(Debug)]
pub enum AppError {
    Network(network_client::NetworkError),
    Auth(auth::AuthError),
    Checkin(checkin::CheckinError),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Network(err) => write!(f, "Network error: {}", err),
            AppError::Auth(err) => write!(f, "Login error: {}", err),
            AppError::Checkin(err) => write!(f, "Check-in error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Network(err) => Some(err),
            AppError::Auth(err) => Some(err),
            AppError::Checkin(err) => Some(err),
        }
    }
}

impl From<network_client::NetworkError> for AppError {
    fn from(err: network_client::NetworkError) -> Self {
        AppError::Network(err)
    }
}

impl From<auth::AuthError> for AppError {
    fn from(err: auth::AuthError) -> Self {
        AppError::Auth(err)
    }
}

impl From<checkin::CheckinError> for AppError {
    fn from(err: checkin::CheckinError) -> Self {
        AppError::Checkin(err)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Daily check-in for the Fudan zlapp portal", long_about = None)]
struct Args {
    /// "<student id> <password>", separated by a single space
    #[clap(value_parser, env = "ZLAPP_ACCOUNT", hide_env_values = true)]
    account: Credentials,

    /// How many times a login captcha challenge is answered before giving up
    #[clap(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    login_retries: u32,

    /// How many check-in submissions are attempted while the captcha keeps being rejected
    #[clap(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    checkin_retries: u32,

    /// Delay between rejected check-in submissions, in milliseconds
    #[clap(long, default_value_t = 1500)]
    checkin_backoff_ms: u64,

    /// Path to the tesseract executable
    #[clap(long, default_value = "tesseract")]
    tesseract: PathBuf,

    /// Minimum OCR confidence (0-100) before a captcha reading is used
    #[clap(long, default_value_t = 0.0)]
    min_confidence: f32,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            login_retries: self.login_retries,
            checkin_retries: self.checkin_retries,
            checkin_backoff: Duration::from_millis(self.checkin_backoff_ms),
            tesseract: self.tesseract.clone(),
            min_confidence: self.min_confidence,
            ..RunConfig::default()
        }
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {}[line:{}] - {}: {}",
                buf.timestamp(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.level(),
                record.args()
            )
        })
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logger();

    let config = args.run_config();
    info!("Account: {}", args.account.identifier);

    let session = match PortalSession::new(BASE_HEADERS.clone()) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to set up HTTP session: {}", AppError::from(e));
            return ExitCode::FAILURE;
        }
    };
    let solver = TesseractSolver::new(config.tesseract.clone(), config.min_confidence);

    let result = workflow::run_daily(&session, &solver, &args.account, &config, utils::local_today()).await;
    auth::close(&session, &config.endpoints).await;
    drop(session);

    match result {
        Ok(RunOutcome::AlreadySubmitted) => {
            info!("Nothing to do, today's check-in already exists");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Submitted { message, verified }) => {
            info!("Check-in finished: {} (verified: {})", message, verified);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
