use std::fmt;
use std::time::Duration;

use tonic::Status;

/// Failure kinds for BMC operations. Each carries a short machine-readable
/// kind plus a human message; the conversion to `Status` fixes the mapping
/// used at every RPC boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BmcError {
    /// The server record has no control endpoints at all.
    NoControlEndpoint,
    /// The server record names an endpoint type no driver handles.
    UnsupportedType(String),
    /// The BMC refused a new session and cleanup-then-retry also failed.
    SessionLimit(String),
    /// The operation exceeded its bound.
    Timeout { operation: String, limit: Duration },
    /// Malformed BMC response or a missing required header.
    Protocol(String),
    /// Network or subprocess failure reaching the BMC.
    Transport(String),
    Internal(String),
}

impl BmcError {
    pub fn kind(&self) -> &'static str {
        match self {
            BmcError::NoControlEndpoint => "no_control_endpoint",
            BmcError::UnsupportedType(_) => "unsupported_bmc_type",
            BmcError::SessionLimit(_) => "session_limit",
            BmcError::Timeout { .. } => "timeout",
            BmcError::Protocol(_) => "protocol",
            BmcError::Transport(_) => "transport",
            BmcError::Internal(_) => "internal",
        }
    }
}

impl std::error::Error for BmcError {}

impl fmt::Display for BmcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BmcError::NoControlEndpoint => write!(f, "server has no control endpoints"),
            BmcError::UnsupportedType(t) => write!(f, "unsupported BMC endpoint type: {t}"),
            BmcError::SessionLimit(msg) => write!(f, "BMC session limit: {msg}"),
            BmcError::Timeout { operation, limit } => {
                write!(f, "{operation} timed out after {}s", limit.as_secs_f64())
            }
            BmcError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            BmcError::Transport(msg) => write!(f, "transport error: {msg}"),
            BmcError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<BmcError> for Status {
    fn from(err: BmcError) -> Self {
        let msg = format!("{err}");
        match err {
            BmcError::NoControlEndpoint | BmcError::UnsupportedType(_) => {
                Status::failed_precondition(msg)
            }
            BmcError::SessionLimit(_) => Status::resource_exhausted(msg),
            BmcError::Timeout { .. } => Status::deadline_exceeded(msg),
            BmcError::Protocol(_) | BmcError::Internal(_) => Status::internal(msg),
            BmcError::Transport(_) => Status::unavailable(msg),
        }
    }
}

impl From<reqwest::Error> for BmcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BmcError::Timeout {
                operation: "http request".to_owned(),
                limit: Duration::ZERO,
            }
        } else if err.is_connect() || err.is_request() {
            BmcError::Transport(format!("http error: {err}"))
        } else {
            BmcError::Protocol(format!("http error: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tonic::Code;

    use super::BmcError;

    #[test]
    fn status_mapping() {
        let cases = [
            (BmcError::NoControlEndpoint, Code::FailedPrecondition),
            (
                BmcError::UnsupportedType("ilo".to_owned()),
                Code::FailedPrecondition,
            ),
            (
                BmcError::SessionLimit("full".to_owned()),
                Code::ResourceExhausted,
            ),
            (
                BmcError::Timeout {
                    operation: "mc info".to_owned(),
                    limit: Duration::from_secs(10),
                },
                Code::DeadlineExceeded,
            ),
            (
                BmcError::Protocol("missing X-Auth-Token".to_owned()),
                Code::Internal,
            ),
            (
                BmcError::Transport("connection refused".to_owned()),
                Code::Unavailable,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(tonic::Status::from(err).code(), code);
        }
    }
}
