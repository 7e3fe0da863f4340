//! Minimal Bot API client: `getUpdates` / `sendMessage` with bounded retry.
//!
//! Every failure is classified into an [`ApiError`] with a stable kind and a
//! transient flag. Only transient errors are retried; the delay honors a
//! provider retry hint before falling back to the configured backoff schedule.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{config::RuntimeConfig, errors::Error, Result};
use reqwest::{header::HeaderMap, StatusCode};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const OP_GET_UPDATES: &str = "getUpdates";
pub const OP_SEND_MESSAGE: &str = "sendMessage";
const ATTEMPT_HEADER: &str = "x-relay-attempt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiErrorKind {
    NetworkError,
    Timeout,
    HttpError,
    InvalidJson,
    InvalidResponseShape,
    InvalidResultShape,
    ApiError,
}

impl ApiErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkError => "network-error",
            Self::Timeout => "timeout",
            Self::HttpError => "http-error",
            Self::InvalidJson => "invalid-json",
            Self::InvalidResponseShape => "invalid-response-shape",
            Self::InvalidResultShape => "invalid-result-shape",
            Self::ApiError => "api-error",
        }
    }
}

impl std::fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured client failure. Serialized as the `detail` of [`Error::Channel`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{operation} {kind}: {description}")]
pub struct ApiError {
    pub operation: String,
    pub kind: ApiErrorKind,
    pub transient: bool,
    pub description: String,
    pub status_code: Option<u16>,
    pub api_error_code: Option<i64>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(operation: &str, kind: ApiErrorKind, transient: bool, description: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            kind,
            transient,
            description: description.into(),
            status_code: None,
            api_error_code: None,
            retry_after_seconds: None,
        }
    }
}

impl From<ApiError> for Error {
    fn from(e: ApiError) -> Self {
        let detail = serde_json::to_string(&e).unwrap_or_else(|_| e.to_string());
        Error::Channel {
            operation: e.operation,
            transient: e.transient,
            detail,
        }
    }
}

/// Sleep hook between retries, swappable so tests can record instead of wait.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Clone, Debug)]
pub struct ApiClientConfig {
    pub token: String,
    pub api_base: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
}

impl ApiClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: relay_core::config::DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(10),
            max_retries: 2,
            backoff: vec![Duration::from_millis(250), Duration::from_millis(500)],
        }
    }

    pub fn from_runtime(cfg: &RuntimeConfig) -> Self {
        Self {
            token: cfg.token.clone(),
            api_base: cfg.api_base.clone(),
            timeout: cfg.http_timeout,
            max_retries: cfg.max_retries,
            backoff: cfg.backoff.clone(),
        }
    }
}

/// `getUpdates` request body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GetUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub limit: u32,
    #[serde(rename = "timeout")]
    pub timeout_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_updates: Option<Vec<String>>,
}

impl Default for GetUpdates {
    fn default() -> Self {
        Self {
            offset: None,
            limit: 100,
            timeout_seconds: 0,
            allowed_updates: None,
        }
    }
}

/// `sendMessage` request body. Numeric ids go out as JSON numbers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SendMessage {
    #[serde(serialize_with = "numeric_if_possible")]
    pub chat_id: String,
    pub text: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "numeric_if_possible_opt"
    )]
    pub reply_to_message_id: Option<String>,
}

fn numeric_if_possible<S: Serializer>(v: &str, s: S) -> std::result::Result<S::Ok, S::Error> {
    match v.trim().parse::<i64>() {
        Ok(n) => s.serialize_i64(n),
        Err(_) => s.serialize_str(v),
    }
}

fn numeric_if_possible_opt<S: Serializer>(
    v: &Option<String>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match v {
        Some(v) => numeric_if_possible(v, s),
        None => s.serialize_none(),
    }
}

/// Remote operations the channel adapter depends on.
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn get_updates(&self, req: &GetUpdates) -> std::result::Result<Vec<Map<String, Value>>, ApiError>;
    async fn send_message(&self, req: &SendMessage) -> std::result::Result<Map<String, Value>, ApiError>;
}

pub struct TelegramApiClient {
    cfg: ApiClientConfig,
    http: reqwest::Client,
    sleeper: Arc<dyn Sleeper>,
}

impl TelegramApiClient {
    pub fn new(cfg: ApiClientConfig) -> Result<Self> {
        Self::with_sleeper(cfg, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(mut cfg: ApiClientConfig, sleeper: Arc<dyn Sleeper>) -> Result<Self> {
        cfg.token = cfg.token.trim().to_string();
        if cfg.token.is_empty() {
            return Err(Error::Config("token must be a non-empty string".to_string()));
        }
        if cfg.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".to_string()));
        }
        cfg.api_base = cfg.api_base.trim().trim_end_matches('/').to_string();
        if cfg.api_base.is_empty() {
            return Err(Error::Config("api_base must be a non-empty URL".to_string()));
        }
        if cfg.backoff.is_empty() {
            cfg.backoff = vec![Duration::ZERO];
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::External(format!("reqwest client build: {e}")))?;

        Ok(Self { cfg, http, sleeper })
    }

    fn url(&self, operation: &str) -> String {
        format!("{}/bot{}/{}", self.cfg.api_base, self.cfg.token, operation)
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let idx = usize::try_from(attempt).unwrap_or(usize::MAX);
        self.cfg
            .backoff
            .get(idx)
            .or_else(|| self.cfg.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// POST `payload` with retries; returns the envelope's `result` value.
    async fn request<P: Serialize + Sync>(
        &self,
        operation: &str,
        payload: &P,
        long_poll: Duration,
    ) -> std::result::Result<Value, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            match self.attempt_once(operation, payload, attempt, long_poll).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !e.transient || attempt >= self.cfg.max_retries {
                        return Err(e);
                    }
                    let delay = e
                        .retry_after_seconds
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.backoff_for_attempt(attempt));
                    warn!(
                        operation,
                        attempt,
                        kind = %e.kind,
                        delay_ms = delay.as_millis() as u64,
                        "transient api error, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_once<P: Serialize + Sync>(
        &self,
        operation: &str,
        payload: &P,
        attempt: u32,
        long_poll: Duration,
    ) -> std::result::Result<Value, ApiError> {
        debug!(operation, attempt, "api request");
        let resp = self
            .http
            .post(self.url(operation))
            .header(ATTEMPT_HEADER, attempt.to_string())
            .timeout(self.cfg.timeout + long_poll)
            .json(payload)
            .send()
            .await
            .map_err(|e| transport_error(operation, &e))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| transport_error(operation, &e))?;

        if !status.is_success() {
            return Err(http_error(operation, status, &headers, &body));
        }

        let parsed: Value = serde_json::from_slice(&body).map_err(|_| {
            ApiError::new(
                operation,
                ApiErrorKind::InvalidJson,
                false,
                "response body is not valid JSON",
            )
        })?;

        extract_result(operation, parsed)
    }
}

#[async_trait]
impl BotApi for TelegramApiClient {
    async fn get_updates(&self, req: &GetUpdates) -> std::result::Result<Vec<Map<String, Value>>, ApiError> {
        let long_poll = Duration::from_secs(u64::from(req.timeout_seconds));
        let result = self.request(OP_GET_UPDATES, req, long_poll).await?;
        let Value::Array(items) = result else {
            return Err(ApiError::new(
                OP_GET_UPDATES,
                ApiErrorKind::InvalidResultShape,
                false,
                "result must be a list",
            ));
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(m) => Some(m),
                _ => None,
            })
            .collect())
    }

    async fn send_message(&self, req: &SendMessage) -> std::result::Result<Map<String, Value>, ApiError> {
        match self.request(OP_SEND_MESSAGE, req, Duration::ZERO).await? {
            Value::Object(m) => Ok(m),
            _ => Err(ApiError::new(
                OP_SEND_MESSAGE,
                ApiErrorKind::InvalidResultShape,
                false,
                "result must be an object",
            )),
        }
    }
}

fn transport_error(operation: &str, e: &reqwest::Error) -> ApiError {
    let kind = if e.is_timeout() {
        ApiErrorKind::Timeout
    } else {
        ApiErrorKind::NetworkError
    };
    ApiError::new(operation, kind, true, e.to_string())
}

fn http_error(operation: &str, status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ApiError {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let code = status.as_u16();
    let description = parsed
        .as_ref()
        .and_then(extract_description)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| "HTTP error".to_string());

    let mut err = ApiError::new(
        operation,
        ApiErrorKind::HttpError,
        code >= 500 || code == 429,
        description,
    );
    err.status_code = Some(code);
    err.api_error_code = parsed.as_ref().and_then(extract_error_code);
    if code == 429 {
        err.retry_after_seconds = parsed
            .as_ref()
            .and_then(body_retry_after)
            .or_else(|| header_retry_after(headers));
    }
    err
}

fn extract_result(operation: &str, payload: Value) -> std::result::Result<Value, ApiError> {
    let Value::Object(mut obj) = payload else {
        return Err(ApiError::new(
            operation,
            ApiErrorKind::InvalidResponseShape,
            false,
            "response body must be an object",
        ));
    };

    if obj.get("ok").and_then(Value::as_bool) != Some(true) {
        let payload = Value::Object(obj);
        let api_code = extract_error_code(&payload);
        let transient = matches!(api_code, Some(c) if c == 429 || c >= 500);
        let mut err = ApiError::new(
            operation,
            ApiErrorKind::ApiError,
            transient,
            extract_description(&payload).unwrap_or_else(|| "api returned ok=false".to_string()),
        );
        err.api_error_code = api_code;
        if api_code == Some(429) {
            err.retry_after_seconds = body_retry_after(&payload);
        }
        return Err(err);
    }

    Ok(obj.remove("result").unwrap_or(Value::Null))
}

fn extract_description(payload: &Value) -> Option<String> {
    match payload.get("description")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn extract_error_code(payload: &Value) -> Option<i64> {
    match payload.get("error_code")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn body_retry_after(payload: &Value) -> Option<u64> {
    payload
        .get("parameters")
        .and_then(|p| p.get("retry_after"))
        .and_then(Value::as_u64)
}

/// `Retry-After` as delta-seconds or an HTTP date, rounded up to whole seconds.
fn header_retry_after(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds);
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay_ms = retry_at.signed_duration_since(Utc::now()).num_milliseconds();
    if delay_ms <= 0 {
        return Some(0);
    }
    u64::try_from(delay_ms).ok().map(|ms| ms.div_ceil(1000))
}
