use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error as ThisError;

use crate::value::Value;

/// Every failure a caller can observe. The type is `Clone` because a single transport failure is
/// delivered to every command that was queued at the time.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),
    #[error("connection closed by peer")]
    Eof,
    #[error("framing error: {0}")]
    Framing(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    /// The service answered with an error-shaped response.
    #[error("{0}")]
    Response(ResponseError),
    #[error("connection closed")]
    Closed,
    #[error("usage error: {0}")]
    Usage(String),
    #[error("unable to resolve the socket path: {0}")]
    SockPath(String),
}

impl Error {
    /// Errors after which the connection cannot be used anymore.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Response(_) | Error::Usage(_) | Error::Encode(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}

/// An error reported by the protocol. Carries the message and the complete response PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseError {
    message: String,
    response: Value,
}

impl ResponseError {
    /// Returns `None` unless `response` carries the protocol's error marker.
    pub fn from_response(response: &Value) -> Option<ResponseError> {
        let error = response.get("error")?;
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(ResponseError {
            message,
            response: response.clone(),
        })
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn response(&self) -> &Value {
        &self.response
    }

    pub fn into_response(self) -> Value {
        self.response
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service error: {}", self.message)
    }
}

impl std::error::Error for ResponseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_error_from_error_marker() {
        let response = Value::object([("error", "unable to resolve root"), ("version", "4.9")]);

        let err = ResponseError::from_response(&response).unwrap();

        assert_eq!(err.message(), "unable to resolve root");
        assert_eq!(err.response(), &response);
        assert_eq!(err.to_string(), "service error: unable to resolve root");
    }

    #[test]
    fn response_without_error_marker() {
        let response = Value::object([("version", "4.9")]);

        assert_eq!(ResponseError::from_response(&response), None);
        assert_eq!(ResponseError::from_response(&Value::Null), None);
    }

    #[test]
    fn fatal_errors() {
        assert!(Error::Eof.is_fatal());
        assert!(Error::Closed.is_fatal());
        assert!(Error::Decode("bad".into()).is_fatal());
        assert!(!Error::Usage("run before connect".into()).is_fatal());

        let response = Value::object([("error", "nope")]);
        let err = ResponseError::from_response(&response).unwrap();
        assert!(!Error::Response(err).is_fatal());
    }
}
