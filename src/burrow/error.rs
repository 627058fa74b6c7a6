use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session-level error taxonomy shared between the wire protocol, the access
/// manager and the request dispatcher.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum ErrorCode {
    #[default]
    Ok,
    GeneralError,
    SessionError,
    SessionClosed,
    SessionSuppressedByOther,
    SessionSuppressedBySelf,
    AccessError,
    AccessExpired,
    AccessTrafficOverflow,
    RedirectHost,
    Maintenance,
    UnsupportedServer,
    RequestBlocked,
    NetScan,
    MaxTcpChannel,
    MaxTcpConnectWait,
    UdpClientQuota,
}

impl ErrorCode {
    /// Codes that terminate the session once observed.
    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            ErrorCode::Ok
                | ErrorCode::RequestBlocked
                | ErrorCode::NetScan
                | ErrorCode::MaxTcpChannel
                | ErrorCode::MaxTcpConnectWait
                | ErrorCode::UdpClientQuota
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Who displaced a session when the client count exceeded the token limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressType {
    #[default]
    None,
    YourSelf,
    Other,
}

/// Result carrier for the request dispatcher: converted into a response on
/// the request stream instead of unwinding the network task.
#[derive(Debug, Error)]
#[error("{error_code}: {message}")]
pub struct SessionError {
    pub error_code: ErrorCode,
    pub message: String,
}

impl SessionError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GeneralError, message)
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::general(err.to_string())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_codes() {
        assert!(!ErrorCode::Ok.is_fatal());
        assert!(!ErrorCode::RequestBlocked.is_fatal());
        assert!(!ErrorCode::UdpClientQuota.is_fatal());
        assert!(ErrorCode::AccessTrafficOverflow.is_fatal());
        assert!(ErrorCode::SessionClosed.is_fatal());
        assert!(ErrorCode::RedirectHost.is_fatal());
    }

    #[test]
    fn error_code_serializes_as_name() {
        let s = serde_json::to_string(&ErrorCode::AccessTrafficOverflow).unwrap();
        assert_eq!(s, "\"AccessTrafficOverflow\"");
    }
}
