//! `/sessions/{id}/stream`: conversation snapshot, then patches.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

use branchyard_core::frames::{SessionClientFrame, SessionFrame};

use crate::agent::{AgentSessionManager, SessionEvent, SessionSnapshot};
use crate::fanout::Subscription;

use super::{Ws, WsSink, send_frame};

enum Step {
    Event(Option<SessionEvent>),
    Client(Option<Result<Message, tungstenite::Error>>),
}

fn init_frame(snapshot: SessionSnapshot) -> SessionFrame {
    SessionFrame::Init {
        seq: snapshot.seq,
        status: snapshot.status,
        entries: snapshot.entries,
    }
}

/// Attach a fresh subscription and send its snapshot as `init`.
async fn attach(
    sink: &mut WsSink,
    sessions: &AgentSessionManager,
    id: &str,
) -> Option<(mpsc::UnboundedReceiver<SessionEvent>, Subscription)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (snapshot, subscription) = sessions.attach(id, tx).await?;
    send_frame(sink, &init_frame(snapshot))
        .await
        .then_some((rx, subscription))
}

pub(super) async fn serve_session_stream(ws: Ws, sessions: &AgentSessionManager, id: &str) {
    let (mut sink, mut stream) = ws.split();

    let Some((mut rx, mut subscription)) = attach(&mut sink, sessions, id).await else {
        let frame = SessionFrame::Error {
            message: format!("Session not found: {id}"),
        };
        send_frame(&mut sink, &frame).await;
        let _ = sink.close().await;
        return;
    };
    info!(session_id = id, "Session viewer attached");

    loop {
        let step = tokio::select! {
            event = rx.recv() => Step::Event(event),
            msg = stream.next() => Step::Client(msg),
        };
        match step {
            Step::Event(event) => {
                let frame = match event {
                    Some(SessionEvent::Patch(envelope)) => SessionFrame::from(envelope),
                    Some(SessionEvent::Status(status)) => SessionFrame::Status { status },
                    None => break,
                };
                if !send_frame(&mut sink, &frame).await {
                    break;
                }
            }
            Step::Client(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<SessionClientFrame>(text.as_str()) {
                    Ok(SessionClientFrame::UserMessage { content }) => {
                        if !sessions.send_user_message(id, &content).await {
                            let frame = SessionFrame::Error {
                                message: "Session is not running".to_string(),
                            };
                            send_frame(&mut sink, &frame).await;
                        }
                    }
                    Ok(SessionClientFrame::Resync) => {
                        debug!(session_id = id, "Viewer requested resync");
                        subscription.unsubscribe();
                        let Some((new_rx, new_subscription)) = attach(&mut sink, sessions, id).await
                        else {
                            break;
                        };
                        rx = new_rx;
                        subscription = new_subscription;
                    }
                    Err(e) => debug!(session_id = id, error = %e, "Ignoring malformed client frame"),
                }
            }
            Step::Client(Some(Ok(Message::Close(_)) | Err(_)) | None) => break,
            Step::Client(Some(Ok(_))) => {}
        }
    }

    let _ = sink.close().await;
    debug!(session_id = id, "Session viewer disconnected");
}
