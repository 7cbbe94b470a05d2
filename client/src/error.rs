use std::fmt;

use tonic::{Code, Status};

/// Client-side failure kinds, mapped onto process exit codes by the CLI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// No stored credentials at all.
    AuthMissing,
    /// Stored credentials exist but have expired.
    AuthExpired,
    /// The server rejected our credentials.
    AuthInvalid(String),
    NotFound(String),
    SessionNotFound(String),
    /// Valid identity, but the resource belongs to someone else.
    Unauthorized(String),
    /// The server record itself is unusable (unknown BMC type, no endpoints).
    Config(String),
    Transport(String),
    Timeout(String),
    NotATty,
    Internal(String),
}

impl ClientError {
    /// CLI exit codes: 0 success, 1 user error, 2 auth, 3 not-found,
    /// 4 transport.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::AuthMissing | ClientError::AuthExpired | ClientError::AuthInvalid(_) => 2,
            ClientError::NotFound(_) | ClientError::SessionNotFound(_) => 3,
            ClientError::Transport(_) | ClientError::Timeout(_) => 4,
            ClientError::Unauthorized(_)
            | ClientError::Config(_)
            | ClientError::NotATty
            | ClientError::Internal(_) => 1,
        }
    }
}

impl std::error::Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::AuthMissing => {
                write!(f, "not logged in; run `bmc-cli auth login <email>`")
            }
            ClientError::AuthExpired => {
                write!(f, "session expired; run `bmc-cli auth login <email>`")
            }
            ClientError::AuthInvalid(msg) => write!(f, "authentication failed: {msg}"),
            ClientError::NotFound(msg) => write!(f, "not found: {msg}"),
            ClientError::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            ClientError::Unauthorized(msg) => write!(f, "not authorized: {msg}"),
            ClientError::Config(msg) => write!(f, "server configuration problem: {msg}"),
            ClientError::Transport(msg) => write!(f, "transport failure: {msg}"),
            ClientError::Timeout(msg) => write!(f, "timed out: {msg}"),
            ClientError::NotATty => write!(f, "stdin is not a terminal"),
            ClientError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        let msg = status.message().to_owned();
        match status.code() {
            Code::Unauthenticated => ClientError::AuthInvalid(msg),
            Code::PermissionDenied => ClientError::Unauthorized(msg),
            Code::NotFound => ClientError::NotFound(msg),
            Code::FailedPrecondition | Code::InvalidArgument => ClientError::Config(msg),
            Code::DeadlineExceeded => ClientError::Timeout(msg),
            Code::Unavailable | Code::Cancelled | Code::Aborted | Code::Unknown => {
                ClientError::Transport(msg)
            }
            _ => ClientError::Internal(msg),
        }
    }
}

impl From<tonic::transport::Error> for ClientError {
    fn from(err: tonic::transport::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}
