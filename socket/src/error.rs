//! Peer framework error types.

use std::io;

use thiserror::Error;

use crate::event::EventResult;

/// Errors surfaced by peer start/stop operations.
#[derive(Error, Debug)]
pub enum PeerError {
    /// Binding the listening socket failed
    #[error("bind {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on
        addr: String,
        /// Underlying socket error
        source: io::Error,
    },

    /// Accepting a connection failed
    #[error("accept: {0}")]
    Accept(#[source] io::Error),
}

/// Map an I/O error to the event result a transport stage should report.
///
/// Timeout-class errors become `SocketTimeout`; everything else is a plain
/// `SocketError`.
pub fn error_to_result(err: &io::Error) -> EventResult {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => EventResult::SocketTimeout,
        _ => EventResult::SocketError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_to_result_mapping() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        assert_eq!(error_to_result(&timeout), EventResult::SocketTimeout);

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(error_to_result(&reset), EventResult::SocketError);
    }
}
