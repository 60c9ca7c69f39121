//! Body and header codecs
//!
//! Task headers are always plain JSON. Hit batches travel gzip-compressed
//! because large batches of similar hits shrink well.

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Write;

use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    Json,
    GzipJson,
}

impl Codec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::GzipJson => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                serde_json::to_writer(&mut encoder, value)?;
                encoder.flush()?;
                Ok(encoder.finish()?)
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::GzipJson => Ok(serde_json::from_reader(GzDecoder::new(bytes))?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_gzip_json_shrinks_repetitive_payloads() {
        let payload: Vec<String> = (0..200).map(|_| "page_view".to_string()).collect();

        let plain = Codec::Json.encode(&payload).unwrap();
        let gzipped = Codec::GzipJson.encode(&payload).unwrap();
        assert!(gzipped.len() < plain.len());

        let decoded: Vec<String> = Codec::GzipJson.decode(&gzipped).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<BTreeMap<String, String>, _> = Codec::GzipJson.decode(b"not gzip");
        assert!(result.is_err());

        let result: Result<BTreeMap<String, String>, _> = Codec::Json.decode(b"{");
        assert!(matches!(result, Err(CodecError::Json(_))));
    }
}
