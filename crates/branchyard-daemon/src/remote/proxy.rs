//! HTTP forwarding to a paired remote daemon with failure classification.

use std::time::Instant;

use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::types::{ProxyOptions, RemoteErrorCode, RemoteProxyResult, RemoteTarget};

/// Header carrying the correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Client for remote daemon calls. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RemoteProxy {
    http: reqwest::Client,
}

impl RemoteProxy {
    pub fn new() -> Result<Self, reqwest::Error> {
        // reqwest is built with rustls-no-provider; an `Err` here only means a
        // provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }

    /// Send `method path` with an optional JSON body to `target`.
    ///
    /// Never fails: transport problems, timeouts and bad responses come back
    /// as a result with `ok == false` and an error code.
    pub async fn proxy_to_remote(
        &self,
        target: &RemoteTarget,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: ProxyOptions,
    ) -> RemoteProxyResult {
        let request_id = options
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let url = target.http_url(path);
        let start = Instant::now();

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header(REQUEST_ID_HEADER, &request_id);
        match HeaderValue::from_str(&format!("Bearer {}", target.api_key)) {
            Ok(value) => request = request.header(AUTHORIZATION, value),
            Err(_) => warn!(%request_id, "Remote API key is not a valid header value"),
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(%request_id, %method, %url, "Proxying request to remote");

        let failed = |status: u16, code: RemoteErrorCode, error: String| RemoteProxyResult {
            ok: false,
            status,
            data: Value::Null,
            error: Some(error),
            error_code: Some(code),
            request_id: request_id.clone(),
            duration_ms: elapsed_ms(start),
        };

        // Dropping the in-flight future on timeout aborts the request.
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        };
        let (status, bytes) = match tokio::time::timeout(options.timeout, exchange).await {
            Err(_) => {
                warn!(%request_id, %url, timeout_ms = options.timeout.as_millis(), "Remote request timed out");
                return failed(
                    0,
                    RemoteErrorCode::Timeout,
                    format!("Remote did not respond within {} ms", options.timeout.as_millis()),
                );
            }
            Ok(Err(e)) if e.is_timeout() => {
                return failed(0, RemoteErrorCode::Timeout, e.to_string());
            }
            Ok(Err(e)) => {
                warn!(%request_id, %url, error = %e, "Remote request failed");
                return failed(0, RemoteErrorCode::NetworkError, e.to_string());
            }
            Ok(Ok(exchange)) => exchange,
        };

        let code = status.as_u16();
        if status == StatusCode::UNAUTHORIZED {
            return failed(
                code,
                RemoteErrorCode::AuthError,
                "Remote rejected the API key".to_string(),
            );
        }

        let blank = bytes.iter().all(u8::is_ascii_whitespace);
        let parsed = if blank {
            Ok(Value::Null)
        } else {
            serde_json::from_slice::<Value>(&bytes)
        };

        // 5xx wins over body shape: gateways answer with HTML error pages.
        if status.is_server_error() {
            let data = parsed
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
            let error = remote_error_message(&data)
                .unwrap_or_else(|| format!("Remote server error (HTTP {code})"));
            warn!(%request_id, status = code, %error, "Remote server error");
            return RemoteProxyResult {
                data,
                ..failed(code, RemoteErrorCode::ServerError, error)
            };
        }

        let Ok(data) = parsed else {
            let preview: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
            warn!(%request_id, status = code, %preview, "Remote returned a non-JSON body");
            return failed(
                code,
                RemoteErrorCode::NonJsonResponse,
                format!("Remote returned a non-JSON response (HTTP {code})"),
            );
        };

        let ok = status.is_success();
        RemoteProxyResult {
            ok,
            status: code,
            error: if ok { None } else { remote_error_message(&data) },
            error_code: None,
            data,
            request_id,
            duration_ms: elapsed_ms(start),
        }
    }
}

/// `error` or `message` field of an error body.
fn remote_error_message(data: &Value) -> Option<String> {
    data.get("error")
        .or_else(|| data.get("message"))
        .and_then(Value::as_str)
        .map(String::from)
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
