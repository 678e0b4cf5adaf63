//! Remote proxy result types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use branchyard_core::config::RemoteConfig;

/// Default bound on one remote call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A paired remote daemon.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Base URL, e.g. `http://build-box:47301`.
    pub url: String,
    pub api_key: String,
}

impl RemoteTarget {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Absolute URL for `path`.
    pub fn http_url(&self, path: &str) -> String {
        format!("{}/{}", self.url, path.trim_start_matches('/'))
    }

    /// WebSocket URL for `path`: `http` becomes `ws`, `https` becomes `wss`.
    pub fn ws_url(&self, path: &str) -> String {
        let base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.url.clone()
        };
        format!("{}/{}", base, path.trim_start_matches('/'))
    }
}

impl From<&RemoteConfig> for RemoteTarget {
    fn from(config: &RemoteConfig) -> Self {
        Self::new(&config.url, &config.api_key)
    }
}

// The key stays out of logs.
impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub timeout: Duration,
    /// Correlation id sent as `X-Request-Id`. Generated when absent.
    pub request_id: Option<String>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            request_id: None,
        }
    }
}

impl ProxyOptions {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Why a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorCode {
    Timeout,
    NetworkError,
    AuthError,
    ServerError,
    NonJsonResponse,
}

impl RemoteErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::AuthError => "auth_error",
            Self::ServerError => "server_error",
            Self::NonJsonResponse => "non_json_response",
        }
    }
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one remote call. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProxyResult {
    pub ok: bool,
    /// HTTP status, `0` when no response arrived.
    pub status: u16,
    /// Parsed JSON body, `null` when empty. A 5xx body that is not JSON is
    /// kept as a string.
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<RemoteErrorCode>,
    pub request_id: String,
    pub duration_ms: u64,
}

/// Local half of a dual-target operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Remote half of a dual-target operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<RemoteErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Result of an operation performed on both the local and the remote daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualTargetResult {
    /// `201` both succeeded, `207` local only, otherwise the local failure status.
    pub status_code: u16,
    pub local: LocalOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteOutcome>,
}

impl DualTargetResult {
    pub const CREATED: u16 = 201;
    pub const PARTIAL: u16 = 207;
    pub const LOCAL_FAILED: u16 = 500;

    /// `true` when at least the local half succeeded.
    pub const fn is_success(&self) -> bool {
        self.local.success
    }

    pub const fn is_partial(&self) -> bool {
        self.status_code == Self::PARTIAL
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn urls() {
        let t = RemoteTarget::new("https://box.example:8443/", "k");
        assert_eq!(t.http_url("/api/worktrees"), "https://box.example:8443/api/worktrees");
        assert_eq!(
            t.ws_url("/processes/p1/logs"),
            "wss://box.example:8443/processes/p1/logs"
        );
        let t = RemoteTarget::new("http://127.0.0.1:9000", "k");
        assert_eq!(t.ws_url("sessions/s/stream"), "ws://127.0.0.1:9000/sessions/s/stream");
    }

    #[test]
    fn debug_redacts_key() {
        let t = RemoteTarget::new("http://h", "secret-key");
        assert!(!format!("{t:?}").contains("secret-key"));
    }

    #[test]
    fn error_codes_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(RemoteErrorCode::NonJsonResponse).unwrap(),
            "non_json_response"
        );
        assert_eq!(RemoteErrorCode::AuthError.to_string(), "auth_error");
    }
}
