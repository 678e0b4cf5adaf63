//! WebSocket stream server for process logs and agent sessions.
//!
//! Every connection is routed during the handshake. Ids bound in the
//! [`RemoteRegistry`] are relayed to the paired daemon; everything else is
//! served from the local managers.

mod process_stream;
mod routes;
mod session_stream;

pub use routes::Route;

use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use futures::stream::SplitSink;
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::{debug, info, warn};

use crate::agent::AgentSessionManager;
use crate::process::ProcessManager;
use crate::remote::{RemoteRegistry, relay_socket};

type Ws = WebSocketStream<TcpStream>;
type WsSink = SplitSink<Ws, Message>;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream server handle. Cheap to clone.
#[derive(Clone)]
pub struct StreamServer {
    processes: ProcessManager,
    sessions: AgentSessionManager,
    remotes: Arc<RemoteRegistry>,
    api_key: Option<Arc<str>>,
}

impl StreamServer {
    pub fn new(
        processes: ProcessManager,
        sessions: AgentSessionManager,
        remotes: Arc<RemoteRegistry>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            processes,
            sessions,
            remotes,
            api_key: api_key.map(Arc::from),
        }
    }

    /// Bind `addr` and serve until the future is dropped.
    pub async fn serve_tcp(&self, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Stream server listening");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut route = None;
        let api_key = self.api_key.clone();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if !routes::is_authorized(request, api_key.as_deref()) {
                return Err(routes::reject(StatusCode::UNAUTHORIZED, "missing or invalid API key"));
            }
            match Route::parse(request.uri().path()) {
                Some(r) => {
                    route = Some(r);
                    Ok(response)
                }
                None => Err(routes::reject(StatusCode::NOT_FOUND, "unknown stream endpoint")),
            }
        };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%peer, error = %e, "WebSocket handshake rejected");
                return;
            }
        };
        let Some(route) = route else {
            return;
        };
        debug!(%peer, ?route, "Stream connection");

        if let Some(binding) = self.remotes.lookup(route.remote_kind(), route.id()) {
            let path = route.remote_kind().stream_path(&binding.remote_id);
            if let Err(e) = relay_socket(ws, &binding.target, &path).await {
                warn!(%peer, ?route, error = %e, "Relay failed");
            }
            return;
        }

        match &route {
            Route::ProcessLogs(id) => {
                process_stream::serve_process_logs(ws, &self.processes, id).await;
            }
            Route::SessionStream(id) => {
                session_stream::serve_session_stream(ws, &self.sessions, id).await;
            }
        }
    }
}

/// Serialize and send one JSON frame. `false` once the viewer is gone.
async fn send_frame<T: Serialize>(sink: &mut WsSink, frame: &T) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to serialize frame");
            return true;
        }
    };
    sink.send(Message::text(text)).await.is_ok()
}
