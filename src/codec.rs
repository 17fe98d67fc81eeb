use bytes::{Bytes, BytesMut};
use std::env;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio_util::codec::Decoder;
use tracing::warn;

use crate::bser::BserCodec;
use crate::error::Error;
use crate::json::JsonCodec;
use crate::value::Value;

/// Default upper bound for a single PDU, overridable through `WATCHMAN_MAX_PDU_SIZE`.
pub const DEFAULT_MAX_PDU_SIZE: usize = 512 * 1024 * 1024;

/// The serialization collaborator. Implementations know how to find PDU boundaries in a byte
/// stream and how to convert between PDU bytes and [`Value`]s.
pub trait PduCodec: Send + Sync + 'static {
    /// Returns the length of the PDU at the front of `buf`, or `None` if more bytes are needed.
    /// Must not assume that `buf` holds a single PDU.
    fn pdu_length(&self, buf: &[u8]) -> Result<Option<usize>, Error>;

    /// Like [`PduCodec::pdu_length`], for a `buf` whose first `scanned` bytes were already
    /// examined by a call that returned `None`. Delimiter based codecs resume from there.
    fn pdu_length_from(&self, buf: &[u8], scanned: usize) -> Result<Option<usize>, Error> {
        let _ = scanned;
        self.pdu_length(buf)
    }

    /// Decodes one complete PDU, as delimited by `pdu_length`.
    fn decode(&self, pdu: &[u8]) -> Result<Value, Error>;

    /// Encodes `value` as one complete PDU, header included.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, Error>;
}

/// The encodings spoken by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Encoding {
    #[default]
    Bser,
    Json,
}

impl Encoding {
    pub fn codec(self) -> Arc<dyn PduCodec> {
        match self {
            Encoding::Bser => Arc::new(BserCodec),
            Encoding::Json => Arc::new(JsonCodec),
        }
    }
}

pub fn max_pdu_size_from_env() -> usize {
    match env::var("WATCHMAN_MAX_PDU_SIZE") {
        Ok(s) => s.parse().unwrap_or_else(|_| {
            warn!("WATCHMAN_MAX_PDU_SIZE is not a number: {}", s);
            DEFAULT_MAX_PDU_SIZE
        }),
        Err(_) => DEFAULT_MAX_PDU_SIZE,
    }
}

/// Splits the inbound byte stream into PDUs. Each item is the raw bytes of one complete PDU;
/// decoding them is left to the connection so it can be done off the reader task.
pub struct PduFramer {
    codec: Arc<dyn PduCodec>,
    max_pdu_size: usize,
    // Bytes at the front of the buffer already known not to complete a PDU.
    scanned: usize,
}

impl PduFramer {
    pub fn new(codec: Arc<dyn PduCodec>, max_pdu_size: usize) -> PduFramer {
        PduFramer {
            codec,
            max_pdu_size,
            scanned: 0,
        }
    }
}

impl Decoder for PduFramer {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let scanned = self.scanned.min(src.len());
        let len = match self.codec.pdu_length_from(&src[..], scanned)? {
            Some(len) => len,
            None => {
                self.scanned = src.len();
                if src.len() > self.max_pdu_size {
                    return Err(Error::Framing(format!(
                        "buffered {} bytes without a complete PDU, limit is {}",
                        src.len(),
                        self.max_pdu_size
                    )));
                }
                return Ok(None); // Not enough data to delimit a PDU.
            }
        };

        if len == 0 {
            return Err(Error::Framing("zero length PDU".to_string()));
        }
        if len > self.max_pdu_size {
            return Err(Error::Framing(format!(
                "PDU of {} bytes exceeds limit of {}",
                len, self.max_pdu_size
            )));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.scanned = 0;
        Ok(Some(src.split_to(len).freeze()))
    }
}
