pub mod bser;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod guard;
pub mod json;
pub mod queue;
pub mod sockpath;
pub mod transport;
pub mod value;

pub use codec::{Encoding, PduCodec};
pub use config::{Callback, ConnectionBuilder};
pub use connection::{Connection, Phase, ResponseFuture};
pub use error::{Error, ResponseError};
pub use value::{Value, ValueError};

pub type Result<T> = std::result::Result<T, Error>;
