use crate::codec::{Decoder, Encoder, sealed};
use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON payload codec.
///
/// Every payload crossing an activity boundary is a `serde` type, so this is
/// the codec both worker pools and the submission façade share.
///
/// # Example
/// ```
/// use crystalflow_core::codec::{Decoder, Encoder};
/// use crystalflow_core::serialization::JsonCodec;
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&vec!["Ca Ti O3".to_string()]).unwrap();
/// let back: Vec<String> = codec.decode(&bytes).unwrap();
/// assert_eq!(back, vec!["Ca Ti O3".to_string()]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Encoder for JsonCodec {}
impl Decoder for JsonCodec {}

impl<T> sealed::EncodeValue<T> for JsonCodec
where
    T: Serialize,
{
    fn encode_value(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

impl<T> sealed::DecodeValue<T> for JsonCodec
where
    T: DeserializeOwned,
{
    fn decode_value(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
