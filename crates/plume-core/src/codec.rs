//! Payload codecs.
//!
//! Serialization belongs to the caller; a call only needs to turn inbound
//! bytes into requests and responses into outbound bytes.

use crate::error::CodecError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Request/response codec for one method
pub trait Codec: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn decode(&self, buf: Bytes) -> Result<Self::Request, CodecError>;

    fn encode(&self, message: &Self::Response) -> Result<Bytes, CodecError>;
}

/// Passes payload bytes through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Request = Bytes;
    type Response = Bytes;

    fn decode(&self, buf: Bytes) -> Result<Bytes, CodecError> {
        Ok(buf)
    }

    fn encode(&self, message: &Bytes) -> Result<Bytes, CodecError> {
        Ok(message.clone())
    }
}

/// JSON payloads via serde
pub struct JsonCodec<Req, Resp> {
    _marker: PhantomData<fn(Resp) -> Req>,
}

impl<Req, Resp> JsonCodec<Req, Resp> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp> Default for JsonCodec<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> Codec for JsonCodec<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    fn decode(&self, buf: Bytes) -> Result<Req, CodecError> {
        serde_json::from_slice(&buf).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode(&self, message: &Resp) -> Result<Bytes, CodecError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Greeting {
        name: String,
    }

    #[test]
    fn test_json_decode() {
        let codec = JsonCodec::<Greeting, Vec<u32>>::new();
        let req = codec.decode(Bytes::from_static(br#"{"name":"ada"}"#)).unwrap();
        assert_eq!(req.name, "ada");
        assert_eq!(codec.encode(&vec![1, 2]).unwrap(), Bytes::from_static(b"[1,2]"));
    }

    #[test]
    fn test_json_decode_failure() {
        let codec = JsonCodec::<Greeting, ()>::new();
        let err = codec.decode(Bytes::from_static(b"{")).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
