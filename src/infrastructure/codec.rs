//! Value Codec contract: UUID-keyed conversion between raw payloads and
//! typed characteristic values.

use crate::domain::models::CharValue;
use crate::error::{DecodeError, EncodeError};

pub trait ValueCodec: Send + Sync {
    fn decode(&self, uuid: &str, data: &[u8]) -> Result<CharValue, DecodeError>;
    fn encode(&self, uuid: &str, value: &CharValue) -> Result<Vec<u8>, EncodeError>;
}

/// Pass-through codec used when no value catalog is plugged in.
///
/// Every payload decodes to [`CharValue::Bytes`]; only `Bytes` and `Text`
/// values can be encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl ValueCodec for RawCodec {
    fn decode(&self, _uuid: &str, data: &[u8]) -> Result<CharValue, DecodeError> {
        Ok(CharValue::Bytes(data.to_vec()))
    }

    fn encode(&self, uuid: &str, value: &CharValue) -> Result<Vec<u8>, EncodeError> {
        match value {
            CharValue::Bytes(bytes) => Ok(bytes.clone()),
            CharValue::Text(text) => Ok(text.as_bytes().to_vec()),
            other => Err(EncodeError {
                uuid: uuid.to_string(),
                reason: format!("raw codec cannot encode {:?}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codec_passes_bytes_through() {
        let value = RawCodec.decode("0x2a19", &[0x55]).unwrap();
        assert_eq!(value, CharValue::Bytes(vec![0x55]));
        assert_eq!(RawCodec.encode("0x2a19", &value).unwrap(), vec![0x55]);
        assert_eq!(
            RawCodec
                .encode("0x2a00", &CharValue::Text("hi".to_string()))
                .unwrap(),
            b"hi".to_vec()
        );
    }

    #[test]
    fn test_raw_codec_rejects_structured_values() {
        let err = RawCodec.encode("0x2a19", &CharValue::UInt(1)).unwrap_err();
        assert_eq!(err.uuid, "0x2a19");
    }
}
