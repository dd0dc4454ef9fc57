use thiserror::Error as ThisError;

use crate::connection::ConnectionState;

/// Crate-wide error taxonomy. `Clone` so a single connection fault can fan
/// out to every pending reply handle.
///
/// Connection-fatal faults: `Protocol`, `Transport`. Per-request faults:
/// `Server`, `Timeout`, `Cancelled`, `InvalidArgument`. `SubmissionRejected`
/// is returned synchronously when the connection state does not admit the
/// request.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The connection state does not admit the submission.
    #[error("submission rejected; connection is {0}")]
    SubmissionRejected(ConnectionState),
    /// The peer violated the protocol or sent an undecodable frame.
    #[error("protocol error; {0}")]
    Protocol(String),
    /// The underlying transport failed.
    #[error("transport error; {0}")]
    Transport(String),
    /// The server returned an error reply for this request.
    #[error("server error; {0}")]
    Server(String),
    /// The request's deadline elapsed before a reply arrived.
    #[error("request timed out")]
    Timeout,
    /// The request was cancelled before completing.
    #[error("cancelled; {0}")]
    Cancelled(String),
    /// Client-side validation failed; never transmitted to the server.
    #[error("invalid argument; {0}")]
    InvalidArgument(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
