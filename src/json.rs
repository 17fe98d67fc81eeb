use crate::codec::PduCodec;
use crate::error::Error;
use crate::value::Value;

/// The line oriented JSON protocol: one compact JSON document per line.
pub struct JsonCodec;

impl PduCodec for JsonCodec {
    fn pdu_length(&self, buf: &[u8]) -> Result<Option<usize>, Error> {
        self.pdu_length_from(buf, 0)
    }

    fn pdu_length_from(&self, buf: &[u8], scanned: usize) -> Result<Option<usize>, Error> {
        let start = scanned.min(buf.len());
        Ok(buf[start..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|index| start + index + 1))
    }

    fn decode(&self, pdu: &[u8]) -> Result<Value, Error> {
        let json: serde_json::Value =
            serde_json::from_slice(pdu).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(Value::from(json))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, Error> {
        let json = serde_json::Value::from(value.clone());
        let mut bytes = serde_json::to_vec(&json).map_err(|e| Error::Encode(e.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_length_up_to_newline() {
        assert_eq!(JsonCodec.pdu_length(b"{\"a\":1}\n{").unwrap(), Some(8));
        assert_eq!(JsonCodec.pdu_length(b"{\"a\":1}").unwrap(), None);
        assert_eq!(JsonCodec.pdu_length(b"").unwrap(), None);
    }

    #[test]
    fn pdu_length_resumes_after_scanned_prefix() {
        let buf = b"{\"a\":\"xxxx\"}\n";

        assert_eq!(JsonCodec.pdu_length_from(&buf[..6], 0).unwrap(), None);
        assert_eq!(JsonCodec.pdu_length_from(buf, 6).unwrap(), Some(buf.len()));
        assert_eq!(JsonCodec.pdu_length_from(buf, buf.len()).unwrap(), None);
    }

    #[test]
    fn encode_command() {
        let command = Value::array(["watch-project", "/tmp/repo"]);

        let encoded = JsonCodec.encode(&command).unwrap();

        assert_eq!(encoded, b"[\"watch-project\",\"/tmp/repo\"]\n".to_vec());
    }

    #[test]
    fn decode_response() {
        let value = JsonCodec
            .decode(b"{\"version\":\"2024.01.01.00\",\"clock\":\"c:0:1\"}\n")
            .unwrap();

        assert_eq!(
            value,
            Value::object([("version", "2024.01.01.00"), ("clock", "c:0:1")])
        );
    }

    #[test]
    fn decode_garbage() {
        assert!(matches!(
            JsonCodec.decode(b"{not json}\n"),
            Err(Error::Decode(_))
        ));
    }
}
