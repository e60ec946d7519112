//! Record encoding: JSON with a one-byte tag, optionally LZ4-compressed.
//!
//! Layout: `[tag][payload]`, where the tag is `J` for plain JSON and `Z` for
//! LZ4 (size-prepended block). Untagged JSON objects are accepted on read so
//! hand-written records load too.

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::StoreError;

pub const TAG_JSON: u8 = b'J';
pub const TAG_LZ4: u8 = b'Z';

/// Whether this build can write compressed records.
pub const fn compression_available() -> bool {
    cfg!(feature = "lz4")
}

/// Compress with LZ4.
#[cfg(feature = "lz4")]
pub fn compress_lz4(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompress LZ4 data.
#[cfg(feature = "lz4")]
pub fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(data).map_err(|e| StoreError::Compression(e.to_string()))
}

#[cfg(not(feature = "lz4"))]
pub fn decompress_lz4(_data: &[u8]) -> Result<Vec<u8>, StoreError> {
    Err(StoreError::Compression(
        "record is LZ4-compressed but the lz4 feature is disabled".to_string(),
    ))
}

/// Encode a record. `compress` is ignored when LZ4 support is not built in.
pub fn encode<T: Serialize>(value: &T, compress: bool) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(value)?;

    #[cfg(feature = "lz4")]
    {
        if compress {
            let mut out = vec![TAG_LZ4];
            out.extend_from_slice(&compress_lz4(&json));
            return Ok(out);
        }
    }
    #[cfg(not(feature = "lz4"))]
    let _ = compress;

    let mut out = Vec::with_capacity(json.len() + 1);
    out.push(TAG_JSON);
    out.extend_from_slice(&json);
    Ok(out)
}

/// Decode a record written by [`encode`] (or untagged JSON).
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    match bytes.split_first() {
        Some((&TAG_JSON, payload)) => Ok(serde_json::from_slice(payload)?),
        Some((&TAG_LZ4, payload)) => Ok(serde_json::from_slice(&decompress_lz4(payload)?)?),
        _ => Ok(serde_json::from_slice(bytes)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: String,
        values: Vec<f64>,
    }

    fn record() -> Record {
        Record {
            id: "s1".into(),
            values: vec![0.25; 64],
        }
    }

    #[test]
    fn test_plain_roundtrip() {
        let bytes = encode(&record(), false).unwrap();
        assert_eq!(bytes[0], TAG_JSON);
        let decoded: Record = decode(&bytes).unwrap();
        assert_eq!(decoded, record());
    }

    #[test]
    fn test_untagged_json_is_accepted() {
        let decoded: Record = decode(br#"{"id":"x","values":[1.0]}"#).unwrap();
        assert_eq!(decoded.values, vec![1.0]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decode::<Record>(b"Jnot json"),
            Err(StoreError::Serialization(_))
        ));
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn test_compressed_roundtrip() {
        let bytes = encode(&record(), true).unwrap();
        assert_eq!(bytes[0], TAG_LZ4);
        let plain = encode(&record(), false).unwrap();
        assert!(bytes.len() < plain.len());
        let decoded: Record = decode(&bytes).unwrap();
        assert_eq!(decoded, record());
    }

    #[cfg(not(feature = "lz4"))]
    #[test]
    fn test_compress_request_falls_back_to_json() {
        let bytes = encode(&record(), true).unwrap();
        assert_eq!(bytes[0], TAG_JSON);
        assert!(matches!(
            decode::<Record>(&[TAG_LZ4, 1, 2, 3]),
            Err(StoreError::Compression(_))
        ));
    }
}
