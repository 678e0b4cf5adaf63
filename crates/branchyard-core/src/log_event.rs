//! Output events of a managed process.

use bytes::Bytes;

/// One event in a process log. Within a process the log is strictly ordered
/// and a `Finished` or `Error` event is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Init { is_pty: bool },
    Stdout(Bytes),
    Stderr(Bytes),
    Pty(Bytes),
    Finished { exit_code: i32 },
    Error { message: String },
}

impl LogEvent {
    /// `true` for the events that close a log.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Error { .. })
    }

    /// Payload bytes for output chunks.
    pub const fn data(&self) -> Option<&Bytes> {
        match self {
            Self::Stdout(b) | Self::Stderr(b) | Self::Pty(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_finished_and_error_are_terminal() {
        assert!(LogEvent::Finished { exit_code: 0 }.is_terminal());
        assert!(
            LogEvent::Error {
                message: "x".into()
            }
            .is_terminal()
        );
        assert!(!LogEvent::Stdout(Bytes::from_static(b"hi")).is_terminal());
        assert!(!LogEvent::Init { is_pty: false }.is_terminal());
    }
}
