//! Pseudo-terminal spawning.
//!
//! `portable-pty` handles are blocking; the writer side runs on a blocking
//! task that services input and resize requests from a channel.

use std::io::{Read, Write};

use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{ProcessError, ProcessInput, StartSpec};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// A child attached to a fresh pty.
pub(super) struct PtyProcess {
    pub child: Box<dyn portable_pty::Child + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
    pub input: mpsc::UnboundedSender<ProcessInput>,
}

/// Open a pty, spawn `<shell> -c <command>` on it and start the writer task.
pub(super) fn spawn(process_id: &str, shell: &str, spec: &StartSpec) -> Result<PtyProcess, ProcessError> {
    let pty_err = |e: anyhow::Error| ProcessError::Pty {
        reason: e.to_string(),
    };

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(pty_err)?;

    let mut cmd = CommandBuilder::new(shell);
    cmd.arg("-c");
    cmd.arg(&spec.command);
    cmd.cwd(&spec.cwd);
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ProcessError::SpawnFailed {
            reason: e.to_string(),
        })?;
    // Only the child may hold the slave, or the reader never sees EOF.
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().map_err(pty_err)?;
    let mut writer = pair.master.take_writer().map_err(pty_err)?;
    let master = pair.master;

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<ProcessInput>();
    let pid = process_id.to_string();
    tokio::task::spawn_blocking(move || {
        while let Some(input) = input_rx.blocking_recv() {
            match input {
                ProcessInput::Data(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                        warn!(process_id = %pid, error = %e, "pty write failed");
                        break;
                    }
                }
                ProcessInput::Resize { cols, rows } => {
                    if let Err(e) = master.resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    }) {
                        warn!(process_id = %pid, error = %e, "pty resize failed");
                    }
                }
            }
        }
        debug!(process_id = %pid, "pty writer finished");
    });

    Ok(PtyProcess {
        child,
        reader,
        input: input_tx,
    })
}
