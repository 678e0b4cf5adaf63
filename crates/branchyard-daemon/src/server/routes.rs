//! Stream endpoint routing and handshake checks.

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::remote::RemoteKind;

/// A resolved stream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/processes/{id}/logs`
    ProcessLogs(String),
    /// `/sessions/{id}/stream`
    SessionStream(String),
}

impl Route {
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["processes", id, "logs"] if !id.is_empty() => Some(Self::ProcessLogs((*id).to_string())),
            ["sessions", id, "stream"] if !id.is_empty() => {
                Some(Self::SessionStream((*id).to_string()))
            }
            _ => None,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::ProcessLogs(id) | Self::SessionStream(id) => id,
        }
    }

    pub const fn remote_kind(&self) -> RemoteKind {
        match self {
            Self::ProcessLogs(_) => RemoteKind::Process,
            Self::SessionStream(_) => RemoteKind::Session,
        }
    }
}

/// `true` when no key is configured or the request carries `Bearer <key>`.
pub fn is_authorized(request: &Request, api_key: Option<&str>) -> bool {
    let Some(key) = api_key else {
        return true;
    };
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == key)
}

pub fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_paths() {
        assert_eq!(
            Route::parse("/processes/abc/logs"),
            Some(Route::ProcessLogs("abc".into()))
        );
        assert_eq!(
            Route::parse("/sessions/s-1/stream?token=x"),
            Some(Route::SessionStream("s-1".into()))
        );
        assert_eq!(Route::parse("/processes//logs"), None);
        assert_eq!(Route::parse("/other"), None);
    }

    #[test]
    fn bearer_check() {
        let request = Request::builder()
            .uri("/processes/a/logs")
            .header("authorization", "Bearer k1")
            .body(())
            .unwrap();
        assert!(is_authorized(&request, Some("k1")));
        assert!(!is_authorized(&request, Some("k2")));
        assert!(is_authorized(&request, None));

        let bare = Request::builder().uri("/").body(()).unwrap();
        assert!(!is_authorized(&bare, Some("k1")));
    }
}
