use futures::future::{BoxFuture, FutureExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;

/// A reliable, ordered, connection oriented byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxStream = Box<dyn Stream>;

/// Opens the byte stream a connection runs over.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, path: &Path) -> BoxFuture<'static, io::Result<BoxStream>>;
}

/// Connects to the service's Unix domain socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixConnector;

impl Connector for UnixConnector {
    fn connect(&self, path: &Path) -> BoxFuture<'static, io::Result<BoxStream>> {
        let path: PathBuf = path.to_path_buf();
        async move {
            let stream = UnixStream::connect(&path).await?;
            Ok(Box::new(stream) as BoxStream)
        }
        .boxed()
    }
}
