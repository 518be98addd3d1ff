use anyhow::Result;
use bytes::Bytes;

/// Sealed helper traits for codec implementations.
///
/// A codec states which value types it can handle by implementing
/// `EncodeValue<T>` / `DecodeValue<T>` with its own bounds. The public
/// [`Encoder`] and [`Decoder`] methods dispatch through them.
pub mod sealed {
    use super::*;

    /// Encode one value type.
    pub trait EncodeValue<T>: Send + Sync + 'static {
        fn encode_value(&self, value: &T) -> Result<Bytes>;
    }

    /// Decode one value type.
    pub trait DecodeValue<T>: Send + Sync + 'static {
        fn decode_value(&self, bytes: &[u8]) -> Result<T>;
    }
}

/// Turns activity inputs, activity outputs and workflow results into bytes
/// that can be recorded in a run's history.
pub trait Encoder: Send + Sync + 'static {
    fn encode<T>(&self, value: &T) -> Result<Bytes>
    where
        Self: sealed::EncodeValue<T>,
    {
        sealed::EncodeValue::encode_value(self, value)
    }
}

/// Reverse of [`Encoder`].
pub trait Decoder: Send + Sync + 'static {
    fn decode<T>(&self, bytes: &[u8]) -> Result<T>
    where
        Self: sealed::DecodeValue<T>,
    {
        sealed::DecodeValue::decode_value(self, bytes)
    }
}

/// A codec that can serialize and deserialize payloads.
pub trait Codec: Encoder + Decoder {}

impl<U> Codec for U where U: Encoder + Decoder {}
