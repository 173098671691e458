use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::captcha::{fetch_and_solve, CaptchaError, CaptchaSolver};
use crate::config::{Endpoints, SAVE_HEADERS};
use crate::network_client::{NetworkError, PortalRequest, Transport};
use crate::utils::{now_millis, portal_date};

/// Message the portal answers with when the check-in captcha was wrong.
pub const CAPTCHA_REJECTED: &str = "验证码错误";

/// Fields carried over verbatim from the previous record's `oldInfo` block.
const CARRIED_FIELDS: [&str; 4] = ["province", "city", "area", "sfzx"];

/// Arbitrary key/value state of one check-in, as the portal returns and accepts it.
pub type SubmissionRecord = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub real_name: String,
    pub role_number: String,
}

/// Everything the submitter needs, handed over from the status check.
#[derive(Debug, Clone)]
pub struct CheckinContext {
    pub last_record: SubmissionRecord,
    pub old_record: SubmissionRecord,
    pub profile: UserProfile,
}

#[derive(Debug, Clone)]
pub struct CheckStatus {
    pub already_submitted_today: bool,
    pub last_date: String,
    pub address: Option<String>,
    pub context: CheckinContext,
}

#[derive(Debug)]
pub enum CheckinError {
    Network(NetworkError),
    Captcha(CaptchaError),
    MissingField(String),
    RetriesExhausted { attempts: u32 },
}

impl std::fmt::Display for CheckinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckinError::Network(e) => write!(f, "Network error during check-in: {}", e),
            CheckinError::Captcha(e) => write!(f, "Check-in captcha error: {}", e),
            CheckinError::MissingField(field) => write!(f, "Field '{}' missing from previous record", field),
            CheckinError::RetriesExhausted { attempts } => {
                write!(f, "Check-in captcha still rejected after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for CheckinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckinError::Network(e) => Some(e),
            CheckinError::Captcha(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NetworkError> for CheckinError {
    fn from(err: NetworkError) -> Self {
        CheckinError::Network(err)
    }
}

impl From<serde_json::Error> for CheckinError {
    fn from(err: serde_json::Error) -> Self {
        CheckinError::Network(NetworkError::from(err))
    }
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    d: StatusData,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    info: SubmissionRecord,
    // an empty oldInfo comes back as `[]`
    #[serde(rename = "oldInfo", default)]
    old_info: Value,
    uinfo: RawProfile,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    realname: String,
    role: RawRole,
}

#[derive(Debug, Deserialize)]
struct RawRole {
    number: Value,
}

#[derive(Debug, Deserialize)]
struct GeoApiInfo {
    #[serde(rename = "formattedAddress")]
    formatted_address: String,
    #[serde(rename = "addressComponent", default)]
    address_component: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    m: String,
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// True when the record's `YYYYMMDD` date is `today`.
pub fn is_submitted_on(record_date: &str, today: NaiveDate) -> bool {
    record_date == portal_date(today)
}

/// `geo_api_info` is a JSON document serialised into a string field; decode the inner layer.
fn decode_address(record: &SubmissionRecord) -> Option<String> {
    let raw = record.get("geo_api_info")?.as_str()?;
    match serde_json::from_str::<GeoApiInfo>(raw) {
        Ok(geo) => {
            if let Some(component) = &geo.address_component {
                debug!("Address components: {}", component);
            }
            Some(geo.formatted_address)
        }
        Err(e) => {
            warn!("Could not decode geo_api_info: {}", e);
            None
        }
    }
}

/// Fetches the last submission and decides whether `today` is already recorded.
pub async fn check<T: Transport + ?Sized>(
    transport: &T,
    endpoints: &Endpoints,
    today: NaiveDate,
) -> Result<CheckStatus, CheckinError> {
    debug!("Checking whether today's check-in exists");
    let response = transport.send(PortalRequest::get(endpoints.status)).await?;
    if !response.status.is_success() {
        return Err(CheckinError::Network(NetworkError::ApiError {
            status: response.status,
            message: format!("Failed to fetch check-in status: {}", endpoints.status),
        }));
    }
    let envelope: StatusEnvelope = response.json()?;
    let data = envelope.d;

    let last_date = data
        .info
        .get("date")
        .and_then(Value::as_str)
        .ok_or_else(|| CheckinError::MissingField("date".to_string()))?
        .to_string();
    info!("Last check-in date: {}", last_date);

    let address = decode_address(&data.info);

    let old_record = match data.old_info {
        Value::Object(map) => map,
        _ => SubmissionRecord::new(),
    };
    let profile = UserProfile { real_name: data.uinfo.realname, role_number: value_text(&data.uinfo.role.number) };

    let already_submitted_today = is_submitted_on(&last_date, today);
    if already_submitted_today {
        info!("Already checked in today");
    } else {
        info!("Not checked in yet today");
    }

    Ok(CheckStatus {
        already_submitted_today,
        last_date,
        address,
        context: CheckinContext { last_record: data.info, old_record, profile },
    })
}

/// The previous record with the per-submission fields merged over it.
///
/// Location and status fields come from the old record, never from a fresh lookup.
pub fn build_submission(context: &CheckinContext, now_ms: i64, code: &str) -> Result<SubmissionRecord, CheckinError> {
    let mut record = context.last_record.clone();
    record.insert("tw".to_string(), json!("13"));
    for field in CARRIED_FIELDS {
        let value = context
            .old_record
            .get(field)
            .ok_or_else(|| CheckinError::MissingField(format!("oldInfo.{}", field)))?;
        record.insert(field.to_string(), value.clone());
    }
    record.insert("ismoved".to_string(), json!(0));
    record.insert("realname".to_string(), json!(context.profile.real_name));
    record.insert("number".to_string(), json!(context.profile.role_number));
    record.insert("now_time".to_string(), json!(now_ms));
    record.insert("code".to_string(), json!(code));
    Ok(record)
}

/// Flattens a record into form fields. Nulls are dropped, nested values are sent as JSON text.
pub fn form_fields(record: &SubmissionRecord) -> Vec<(String, String)> {
    record
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), value_text(v)))
        .collect()
}

/// Resubmits the previous record with a fresh captcha until the portal stops
/// complaining about the captcha, at most `max_attempts` times.
///
/// Returns the portal's final message; anything other than a captcha rejection ends the loop.
pub async fn checkin<T, S>(
    transport: &T,
    solver: &S,
    endpoints: &Endpoints,
    context: &CheckinContext,
    max_attempts: u32,
    backoff: Duration,
) -> Result<String, CheckinError>
where
    T: Transport + ?Sized,
    S: CaptchaSolver + ?Sized,
{
    debug!("Submitting check-in");
    for attempt in 1..=max_attempts {
        info!("Recognising check-in captcha (attempt {}/{})", attempt, max_attempts);
        let code = match fetch_and_solve(transport, solver, endpoints.checkin_captcha).await {
            Ok(code) => code,
            Err(e @ (CaptchaError::NoTextDetected | CaptchaError::LowConfidence { .. })) => {
                warn!("{}, fetching another captcha", e);
                tokio::time::sleep(backoff).await;
                continue;
            }
            Err(e) => return Err(CheckinError::Captcha(e)),
        };

        let record = build_submission(context, now_millis(), &code)?;
        debug!("Submission payload: {:?}", record);

        let request = PortalRequest::post_form(endpoints.submit, form_fields(&record))
            .headers(SAVE_HEADERS.clone())
            .no_redirects();
        let response = transport.send(request).await?;
        let save: SaveResponse = response.json()?;
        info!("Portal replied: {}", save.m);

        if !save.m.contains(CAPTCHA_REJECTED) {
            return Ok(save.m);
        }
        warn!("Check-in captcha rejected");
        if attempt < max_attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    Err(CheckinError::RetriesExhausted { attempts: max_attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ok_response, ScriptedSolver, ScriptedTransport};
    use reqwest::header::REFERER;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn status_body(date: &str) -> String {
        let geo = json!({
            "formattedAddress": "上海市杨浦区邯郸路220号复旦大学",
            "addressComponent": { "province": "上海市", "city": "", "district": "杨浦区" }
        });
        json!({
            "e": 0,
            "m": "操作成功",
            "d": {
                "info": {
                    "date": date,
                    "tw": "2",
                    "sfzx": "0",
                    "province": "stale",
                    "address": "上海市杨浦区",
                    "geo_api_info": geo.to_string(),
                    "extra": null
                },
                "oldInfo": { "province": "上海市", "city": "上海市", "area": "上海市 杨浦区", "sfzx": "1" },
                "uinfo": { "realname": "张三", "role": { "number": "20300180001" } }
            }
        })
        .to_string()
    }

    fn save_body(message: &str) -> Vec<u8> {
        json!({ "e": 0, "m": message, "d": {} }).to_string().into_bytes()
    }

    fn context() -> CheckinContext {
        let data: StatusEnvelope = serde_json::from_str(&status_body("20231231")).unwrap();
        let Value::Object(old_record) = data.d.old_info else { panic!("oldInfo is an object") };
        CheckinContext {
            last_record: data.d.info,
            old_record,
            profile: UserProfile { real_name: "张三".into(), role_number: "20300180001".into() },
        }
    }

    #[test]
    fn date_comparison() {
        assert!(is_submitted_on("20240101", today()));
        assert!(!is_submitted_on("20231231", today()));
    }

    #[tokio::test]
    async fn check_reads_nested_record() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        transport.push(endpoints.status, ok_response(status_body("20240101")));

        let status = check(&transport, &endpoints, today()).await.unwrap();

        assert!(status.already_submitted_today);
        assert_eq!(status.last_date, "20240101");
        assert_eq!(status.address.as_deref(), Some("上海市杨浦区邯郸路220号复旦大学"));
        assert_eq!(status.context.profile.real_name, "张三");
        assert_eq!(status.context.profile.role_number, "20300180001");
        assert_eq!(status.context.old_record["sfzx"], "1");
    }

    #[tokio::test]
    async fn check_is_idempotent() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        transport.push(endpoints.status, ok_response(status_body("20231231")));

        let first = check(&transport, &endpoints, today()).await.unwrap();
        let second = check(&transport, &endpoints, today()).await.unwrap();

        assert!(!first.already_submitted_today);
        assert_eq!(first.already_submitted_today, second.already_submitted_today);
    }

    #[tokio::test]
    async fn broken_geo_info_is_not_fatal() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        let body = status_body("20231231").replace("formattedAddress", "somethingElse");
        transport.push(endpoints.status, ok_response(body));

        let status = check(&transport, &endpoints, today()).await.unwrap();
        assert!(status.address.is_none());
    }

    #[tokio::test]
    async fn numeric_role_number_and_empty_old_info() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        let body = json!({
            "d": {
                "info": { "date": "20231231" },
                "oldInfo": [],
                "uinfo": { "realname": "李四", "role": { "number": 20300180002u64 } }
            }
        });
        transport.push(endpoints.status, ok_response(body.to_string()));

        let status = check(&transport, &endpoints, today()).await.unwrap();
        assert_eq!(status.context.profile.role_number, "20300180002");
        assert!(status.context.old_record.is_empty());
        assert!(status.address.is_none());
    }

    #[test]
    fn submission_copies_old_record_fields() {
        let record = build_submission(&context(), 1_704_067_200_000, "ab12").unwrap();

        assert_eq!(record["tw"], "13");
        assert_eq!(record["province"], "上海市");
        assert_eq!(record["city"], "上海市");
        assert_eq!(record["area"], "上海市 杨浦区");
        assert_eq!(record["sfzx"], "1");
        assert_eq!(record["ismoved"], 0);
        assert_eq!(record["realname"], "张三");
        assert_eq!(record["number"], "20300180001");
        assert_eq!(record["now_time"], 1_704_067_200_000i64);
        assert_eq!(record["code"], "ab12");
        // untouched fields survive from the last record
        assert_eq!(record["address"], "上海市杨浦区");
    }

    #[test]
    fn submission_needs_old_location() {
        let mut ctx = context();
        ctx.old_record.remove("area");
        let err = build_submission(&ctx, 0, "ab12").unwrap_err();
        assert!(matches!(err, CheckinError::MissingField(ref f) if f == "oldInfo.area"));
    }

    #[test]
    fn form_fields_flatten_values() {
        let record = build_submission(&context(), 42, "ab12").unwrap();
        let fields = form_fields(&record);
        let get = |key: &str| fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

        assert_eq!(get("ismoved"), Some("0"));
        assert_eq!(get("now_time"), Some("42"));
        assert_eq!(get("province"), Some("上海市"));
        assert_eq!(get("extra"), None);
        assert!(get("geo_api_info").unwrap().contains("formattedAddress"));
    }

    #[tokio::test]
    async fn captcha_rejections_are_retried() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        transport.push(endpoints.checkin_captcha, ok_response(b"img".to_vec()));
        transport.push(endpoints.submit, ok_response(save_body(CAPTCHA_REJECTED)));
        transport.push(endpoints.submit, ok_response(save_body(CAPTCHA_REJECTED)));
        transport.push(endpoints.submit, ok_response(save_body("操作成功")));
        let solver = ScriptedSolver::always("zz99")
            .with_answers(vec![Ok("aa11".into()), Ok("bb22".into()), Ok("cc33".into())]);

        let message = checkin(&transport, &solver, &endpoints, &context(), 10, Duration::ZERO).await.unwrap();

        assert_eq!(message, "操作成功");
        assert_eq!(solver.calls(), 3);
        let posts = transport.sent_to(endpoints.submit);
        assert_eq!(posts.len(), 3);
        let codes: Vec<_> = posts.iter().map(|p| p.form_value("code").unwrap()).collect();
        assert_eq!(codes, ["aa11", "bb22", "cc33"]);
        assert!(posts.iter().all(|p| !p.follow_redirects));
        assert!(posts[0].headers.get(REFERER).is_some());
    }

    #[tokio::test]
    async fn other_messages_end_the_loop() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        transport.push(endpoints.checkin_captcha, ok_response(b"img".to_vec()));
        transport.push(endpoints.submit, ok_response(save_body("今日已填报")));
        let solver = ScriptedSolver::always("zz99");

        let message = checkin(&transport, &solver, &endpoints, &context(), 10, Duration::ZERO).await.unwrap();

        assert_eq!(message, "今日已填报");
        assert_eq!(transport.sent_to(endpoints.submit).len(), 1);
    }

    #[tokio::test]
    async fn persistent_rejection_is_bounded() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        transport.push(endpoints.checkin_captcha, ok_response(b"img".to_vec()));
        transport.push(endpoints.submit, ok_response(save_body(CAPTCHA_REJECTED)));
        let solver = ScriptedSolver::always("zz99");

        let err = checkin(&transport, &solver, &endpoints, &context(), 4, Duration::ZERO).await.unwrap_err();

        assert!(matches!(err, CheckinError::RetriesExhausted { attempts: 4 }));
        assert_eq!(solver.calls(), 4);
        assert_eq!(transport.sent_to(endpoints.submit).len(), 4);
    }

    #[tokio::test]
    async fn unreadable_captcha_is_not_submitted() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        transport.push(endpoints.checkin_captcha, ok_response(b"img".to_vec()));
        transport.push(endpoints.submit, ok_response(save_body("操作成功")));
        let solver = ScriptedSolver::always("zz99").with_answers(vec![Err(CaptchaError::NoTextDetected)]);

        checkin(&transport, &solver, &endpoints, &context(), 10, Duration::ZERO).await.unwrap();

        assert_eq!(solver.calls(), 2);
        assert_eq!(transport.sent_to(endpoints.submit).len(), 1);
    }

    #[tokio::test]
    async fn low_confidence_reading_is_not_submitted() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        transport.push(endpoints.checkin_captcha, ok_response(b"img".to_vec()));
        transport.push(endpoints.submit, ok_response(save_body("操作成功")));
        let solver = ScriptedSolver::always("zz99").with_answers(vec![
            Err(CaptchaError::LowConfidence { text: "z?".into(), confidence: 12.0 }),
            Err(CaptchaError::LowConfidence { text: "2z".into(), confidence: 30.5 }),
        ]);

        checkin(&transport, &solver, &endpoints, &context(), 10, Duration::ZERO).await.unwrap();

        assert_eq!(solver.calls(), 3);
        let posts = transport.sent_to(endpoints.submit);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].form_value("code"), Some("zz99"));
    }

    #[tokio::test]
    async fn low_confidence_readings_count_against_the_budget() {
        let endpoints = Endpoints::default();
        let transport = ScriptedTransport::new();
        transport.push(endpoints.checkin_captcha, ok_response(b"img".to_vec()));
        transport.push(endpoints.submit, ok_response(save_body("操作成功")));
        let low = || -> Result<String, CaptchaError> { Err(CaptchaError::LowConfidence { text: "??".into(), confidence: 5.0 }) };
        let solver = ScriptedSolver::always("zz99").with_answers(vec![low(), low()]);

        let err = checkin(&transport, &solver, &endpoints, &context(), 2, Duration::ZERO).await.unwrap_err();

        assert!(matches!(err, CheckinError::RetriesExhausted { attempts: 2 }));
        assert!(transport.sent_to(endpoints.submit).is_empty());
    }
}
