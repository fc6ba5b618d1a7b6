//! Error taxonomy: the wire-visible numeric codes and the crate error enum.

use thiserror::Error;

/// Numeric error codes carried in protocol error messages.
///
/// Codes in the 2xx range are protocol-level, 3xx are semantic rejections
/// of write-class requests, 4xx are local conditions never sent by peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic,
    ServerError,
    ProtocolError,
    MethodUnknown,
    InvalidToken,
    InvalidSignature,
    CasFail,
    SeqNotMonotonic,
    ImmutableSubstitution,
    NotReachable,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::Generic => 201,
            ErrorCode::ServerError => 202,
            ErrorCode::ProtocolError => 203,
            ErrorCode::MethodUnknown => 204,
            ErrorCode::InvalidToken => 301,
            ErrorCode::InvalidSignature => 302,
            ErrorCode::CasFail => 303,
            ErrorCode::SeqNotMonotonic => 304,
            ErrorCode::ImmutableSubstitution => 305,
            ErrorCode::NotReachable => 401,
        }
    }

    pub fn from_code(code: i32) -> Option<ErrorCode> {
        Some(match code {
            201 => ErrorCode::Generic,
            202 => ErrorCode::ServerError,
            203 => ErrorCode::ProtocolError,
            204 => ErrorCode::MethodUnknown,
            301 => ErrorCode::InvalidToken,
            302 => ErrorCode::InvalidSignature,
            303 => ErrorCode::CasFail,
            304 => ErrorCode::SeqNotMonotonic,
            305 => ErrorCode::ImmutableSubstitution,
            401 => ErrorCode::NotReachable,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Errors surfaced by the crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid peer record: {0}")]
    InvalidPeer(String),

    #[error("operation canceled")]
    Canceled,

    #[error("node is not running")]
    NotRunning,

    #[error("peer rejected request: {code} {message}")]
    Remote { code: i32, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state persistence: {0}")]
    Persistence(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping_roundtrip() {
        for code in [
            ErrorCode::Generic,
            ErrorCode::ServerError,
            ErrorCode::ProtocolError,
            ErrorCode::MethodUnknown,
            ErrorCode::InvalidToken,
            ErrorCode::InvalidSignature,
            ErrorCode::CasFail,
            ErrorCode::SeqNotMonotonic,
            ErrorCode::ImmutableSubstitution,
            ErrorCode::NotReachable,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
    }
}
