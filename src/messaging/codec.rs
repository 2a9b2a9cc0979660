//! Pluggable payload encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Turns typed messages into payload bytes and back.
///
/// Publishers and consumers are generic over the codec, so a custom one only
/// has to agree with itself on both ends of a queue.
pub trait Codec: Send + Sync + 'static {
    /// MIME type set on outgoing messages.
    fn content_type(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, message: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T: Serialize + ?Sized>(&self, message: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(CodecError::encode)
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(payload).map_err(CodecError::decode)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        #[serde(rename = "OrderId")]
        order_id: u64,
    }

    #[test]
    fn test_json_wire_format() {
        let bytes = JsonCodec.encode(&OrderPlaced { order_id: 1 }).unwrap();
        assert_eq!(bytes, br#"{"OrderId":1}"#.to_vec());

        let decoded: OrderPlaced = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(decoded, OrderPlaced { order_id: 1 });
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let err = JsonCodec.decode::<OrderPlaced>(br#"{"id":"x"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
