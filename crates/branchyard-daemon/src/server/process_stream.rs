//! `/processes/{id}/logs`: buffered history, then live output.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use branchyard_core::frames::{ProcessClientFrame, ProcessFrame};
use branchyard_core::log_event::LogEvent;

use crate::process::{ProcessInput, ProcessManager};

use super::{Ws, send_frame};

pub(super) async fn serve_process_logs(ws: Ws, processes: &ProcessManager, id: &str) {
    let (tx, mut rx) = mpsc::unbounded_channel::<LogEvent>();
    let (mut sink, mut stream) = ws.split();

    let Some((history, subscription)) = processes.attach(id, tx) else {
        let frame = ProcessFrame::Error {
            message: format!("Process not found: {id}"),
        };
        send_frame(&mut sink, &frame).await;
        let _ = sink.close().await;
        return;
    };

    for event in &history {
        if !send_frame(&mut sink, &ProcessFrame::from(event)).await {
            return;
        }
        if event.is_terminal() {
            let _ = sink.close().await;
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if !send_frame(&mut sink, &ProcessFrame::from(&event)).await || event.is_terminal() {
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_client_frame(processes, id, text.as_str()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    subscription.unsubscribe();
    let _ = sink.close().await;
    debug!(process_id = id, "Log viewer disconnected");
}

fn handle_client_frame(processes: &ProcessManager, id: &str, text: &str) {
    let input = match serde_json::from_str::<ProcessClientFrame>(text) {
        Ok(ProcessClientFrame::Input { data }) => ProcessInput::Data(Bytes::from(data)),
        Ok(ProcessClientFrame::Resize { cols, rows }) => ProcessInput::Resize { cols, rows },
        Err(e) => {
            debug!(process_id = id, error = %e, "Ignoring malformed client frame");
            return;
        }
    };
    if !processes.handle_input(id, input) {
        debug!(process_id = id, "Input rejected");
    }
}
