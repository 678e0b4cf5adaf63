//! Duplex WebSocket relay from a local viewer to the paired remote daemon.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::types::RemoteTarget;

/// Errors from setting up a relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid relay request for {url}: {reason}")]
    InvalidRequest { url: String, reason: String },

    #[error("Failed to connect to remote: {0}")]
    Connect(#[source] tungstenite::Error),
}

/// Pipe `local` to the remote daemon's `path` until either side closes.
///
/// Text and binary frames pass through unchanged. If the upstream connection
/// cannot be opened, the viewer gets an `error` frame and is closed.
pub async fn relay_socket<S>(
    mut local: WebSocketStream<S>,
    target: &RemoteTarget,
    path: &str,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let url = target.ws_url(path);
    let upstream = match connect_upstream(&url, &target.api_key).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(%url, error = %e, "Relay upstream unavailable");
            let frame = serde_json::json!({"type": "error", "message": e.to_string()});
            let _ = local.send(Message::text(frame.to_string())).await;
            let _ = local.close(None).await;
            return Err(e);
        }
    };
    info!(%url, "Relay established");

    let (mut local_tx, mut local_rx) = local.split();
    let (mut remote_tx, mut remote_rx) = upstream.split();

    let viewer_to_remote = async {
        while let Some(msg) = local_rx.next().await {
            match msg {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    if remote_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    let _ = remote_tx.send(Message::Close(frame)).await;
                    break;
                }
                // Pings are answered per hop.
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Viewer socket error");
                    break;
                }
            }
        }
    };

    let remote_to_viewer = async {
        while let Some(msg) = remote_rx.next().await {
            match msg {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    if local_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    let _ = local_tx.send(Message::Close(frame)).await;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Remote socket error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        () = viewer_to_remote => debug!(%url, "Viewer side closed"),
        () = remote_to_viewer => debug!(%url, "Remote side closed"),
    }

    let _ = remote_tx.close().await;
    let _ = local_tx.close().await;
    info!(%url, "Relay closed");
    Ok(())
}

async fn connect_upstream(
    url: &str,
    api_key: &str,
) -> Result<WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, RelayError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| RelayError::InvalidRequest {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let auth = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| {
        RelayError::InvalidRequest {
            url: url.to_string(),
            reason: e.to_string(),
        }
    })?;
    request.headers_mut().insert("authorization", auth);

    let (stream, _response) = connect_async(request).await.map_err(RelayError::Connect)?;
    Ok(stream)
}
