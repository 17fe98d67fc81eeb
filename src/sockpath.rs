use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::bser::BserCodec;
use crate::codec::PduCodec;
use crate::error::{Error, ResponseError};
use crate::value::Value;

pub const SOCK_ENV: &str = "WATCHMAN_SOCK";

const WATCHMAN: &str = "watchman";

/// Finds the socket to connect to. An explicit path wins, then `WATCHMAN_SOCK`, and finally the
/// path reported by `watchman get-sockname`, which also starts the service if needed.
pub async fn resolve(explicit: Option<&Path>) -> Result<PathBuf, Error> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Some(path) = env::var_os(SOCK_ENV).filter(|path| !path.is_empty()) {
        debug!("using socket path from {}", SOCK_ENV);
        return Ok(PathBuf::from(path));
    }

    query_sockname(OsStr::new(WATCHMAN)).await
}

pub(crate) async fn query_sockname(program: &OsStr) -> Result<PathBuf, Error> {
    let output = Command::new(program)
        .args(["--output-encoding=bser", "get-sockname"])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::SockPath(format!("failed to run {:?}: {}", program, e)))?;

    if !output.status.success() {
        return Err(Error::SockPath(format!(
            "{:?} get-sockname exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let codec = BserCodec;
    let len = codec
        .pdu_length(&output.stdout)
        .map_err(|e| Error::SockPath(e.to_string()))?
        .filter(|len| *len <= output.stdout.len())
        .ok_or_else(|| Error::SockPath("truncated get-sockname response".to_string()))?;
    let response = codec
        .decode(&output.stdout[..len])
        .map_err(|e| Error::SockPath(e.to_string()))?;

    sockname(&response)
}

fn sockname(response: &Value) -> Result<PathBuf, Error> {
    if let Some(err) = ResponseError::from_response(response) {
        return Err(Error::SockPath(err.message().to_string()));
    }

    response
        .field("sockname")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .map_err(|e| Error::SockPath(format!("unexpected get-sockname response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn sockname_from_response() {
        let response = Value::object([
            ("version", "2024.01.01.00"),
            ("sockname", "/tmp/watchman/sock"),
        ]);

        assert_eq!(
            sockname(&response).unwrap(),
            PathBuf::from("/tmp/watchman/sock")
        );
    }

    #[test]
    fn sockname_from_error_response() {
        let response = Value::object([("error", "no state dir")]);

        assert!(matches!(sockname(&response), Err(Error::SockPath(msg)) if msg == "no state dir"));
    }

    #[test]
    fn sockname_missing() {
        let response = Value::object([("version", "2024.01.01.00")]);

        assert!(matches!(sockname(&response), Err(Error::SockPath(_))));
    }

    #[tokio::test]
    #[serial]
    async fn explicit_path_wins() {
        env::set_var(SOCK_ENV, "/from/env");

        let path = resolve(Some(Path::new("/explicit"))).await.unwrap();

        env::remove_var(SOCK_ENV);
        assert_eq!(path, PathBuf::from("/explicit"));
    }

    #[tokio::test]
    #[serial]
    async fn path_from_env() {
        env::set_var(SOCK_ENV, "/from/env");

        let path = resolve(None).await.unwrap();

        env::remove_var(SOCK_ENV);
        assert_eq!(path, PathBuf::from("/from/env"));
    }

    #[tokio::test]
    async fn missing_program() {
        let result = query_sockname(OsStr::new("wmconn-no-such-program")).await;

        assert!(matches!(result, Err(Error::SockPath(_))));
    }
}
