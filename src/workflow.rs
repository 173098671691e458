use chrono::NaiveDate;
use log::{info, warn};

use crate::auth::{login, Credentials};
use crate::captcha::CaptchaSolver;
use crate::checkin::{check, checkin};
use crate::config::RunConfig;
use crate::network_client::Transport;
use crate::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    AlreadySubmitted,
    Submitted { message: String, verified: bool },
}

/// login → check → checkin (only when today is missing) → check.
///
/// Teardown is left to the caller so it also runs when this returns an error.
pub async fn run_daily<T, S>(
    transport: &T,
    solver: &S,
    credentials: &Credentials,
    config: &RunConfig,
    today: NaiveDate,
) -> Result<RunOutcome, AppError>
where
    T: Transport + ?Sized,
    S: CaptchaSolver + ?Sized,
{
    let endpoints = &config.endpoints;
    login(transport, solver, credentials, endpoints, config.login_retries).await?;

    let status = check(transport, endpoints, today).await?;
    if let Some(address) = &status.address {
        info!("Last check-in address: {}", address);
    }
    if status.already_submitted_today {
        return Ok(RunOutcome::AlreadySubmitted);
    }

    let message = checkin(
        transport,
        solver,
        endpoints,
        &status.context,
        config.checkin_retries,
        config.checkin_backoff,
    )
    .await?;

    let verify = check(transport, endpoints, today).await?;
    let verified = verify.already_submitted_today;
    if verified {
        info!("Check-in recorded for today");
    } else {
        warn!("Portal answered {:?} but the last check-in is still dated {}", message, verify.last_date);
    }
    Ok(RunOutcome::Submitted { message, verified })
}
