use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::codec::{max_pdu_size_from_env, Encoding, PduCodec};
use crate::connection::Connection;
use crate::error::Error;
use crate::transport::{Connector, UnixConnector};
use crate::value::Value;

/// Receives every PDU that does not answer a pending command, and the error that broke the
/// connection, if any.
///
/// The callback may be invoked re-entrantly: if it calls [`Connection::force_eof`] or otherwise
/// breaks the connection, it receives the resulting error before its current invocation returns.
pub type Callback = Arc<dyn Fn(Result<Value, Error>) + Send + Sync>;

pub(crate) struct Config {
    pub(crate) sock_path: Option<PathBuf>,
    pub(crate) codec: Arc<dyn PduCodec>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) on_unsolicited: Option<Callback>,
    pub(crate) decode_executor: Option<Handle>,
    pub(crate) max_pdu_size: usize,
    pub(crate) route_unilateral: bool,
}

/// Configures a [`Connection`].
///
/// ```no_run
/// # async fn example() -> wmconn::Result<()> {
/// use wmconn::{Connection, Value};
///
/// let conn = Connection::builder()
///     .on_unsolicited(|pdu| println!("unsolicited: {:?}", pdu))
///     .build()?;
///
/// let version = conn.connect(Connection::default_version_args()).await?;
/// let roots = conn.run(Value::array(["watch-list"])).await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionBuilder {
    sock_path: Option<PathBuf>,
    encoding: Encoding,
    codec: Option<Arc<dyn PduCodec>>,
    connector: Arc<dyn Connector>,
    on_unsolicited: Option<Callback>,
    decode_executor: Option<Handle>,
    max_pdu_size: Option<usize>,
    route_unilateral: bool,
}

impl ConnectionBuilder {
    pub fn new() -> ConnectionBuilder {
        ConnectionBuilder {
            sock_path: None,
            encoding: Encoding::default(),
            codec: None,
            connector: Arc::new(UnixConnector),
            on_unsolicited: None,
            decode_executor: None,
            max_pdu_size: None,
            route_unilateral: false,
        }
    }

    /// Connect to this socket instead of resolving one.
    pub fn sock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sock_path = Some(path.into());
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Use a custom serialization. Takes precedence over [`ConnectionBuilder::encoding`].
    pub fn codec(mut self, codec: Arc<dyn PduCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn on_unsolicited<F>(mut self, callback: F) -> Self
    where
        F: Fn(Result<Value, Error>) + Send + Sync + 'static,
    {
        self.on_unsolicited = Some(Arc::new(callback));
        self
    }

    /// Decode PDUs on the blocking pool of this runtime instead of on the read loop. Large
    /// responses can take a while to decode; pass the handle of a runtime that does not drive
    /// other I/O.
    pub fn decode_executor(mut self, executor: Handle) -> Self {
        self.decode_executor = Some(executor);
        self
    }

    pub fn max_pdu_size(mut self, max_pdu_size: usize) -> Self {
        self.max_pdu_size = Some(max_pdu_size);
        self
    }

    /// Send PDUs marked `unilateral` (subscription notifications, logs) to the unsolicited
    /// callback even while a command is waiting for its response.
    pub fn route_unilateral(mut self, route_unilateral: bool) -> Self {
        self.route_unilateral = route_unilateral;
        self
    }

    /// Must be called from within a tokio runtime; the connection spawns its tasks there.
    pub fn build(self) -> Result<Connection, Error> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::Usage("a connection must be built inside a tokio runtime".into()))?;

        let config = Config {
            sock_path: self.sock_path,
            codec: self.codec.unwrap_or_else(|| self.encoding.codec()),
            connector: self.connector,
            on_unsolicited: self.on_unsolicited,
            decode_executor: self.decode_executor,
            max_pdu_size: self.max_pdu_size.unwrap_or_else(max_pdu_size_from_env),
            route_unilateral: self.route_unilateral,
        };

        Ok(Connection::new(config, runtime))
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("sock_path", &self.sock_path)
            .field("encoding", &self.encoding)
            .field("max_pdu_size", &self.max_pdu_size)
            .field("route_unilateral", &self.route_unilateral)
            .finish_non_exhaustive()
    }
}
