//! Length-delimited JSON framing shared by every socket a beacon speaks on.
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::CohortError;

const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024; // app bundles travel in one frame

/// Encodes and decodes frames of type `T` as a length prefix followed by JSON.
#[derive(Debug)]
pub struct JsonCodec<T> {
    phantom: PhantomData<T>,
    codec: LengthDelimitedCodec,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec();
        JsonCodec {
            phantom: PhantomData,
            codec,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = CohortError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = CohortError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let serialized = serde_json::to_vec(&item)?;
        Ok(self.codec.encode(Bytes::from(serialized), dst)?)
    }
}
