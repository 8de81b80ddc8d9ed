// src/listener/codec.rs
//! Mediator-side stream codec
//!
//! Requests arrive as fixed 2068-byte units and responses leave as fixed
//! 2052-byte units, so framing is a matter of waiting for enough bytes.

use crate::protocol::{RequestFrame, ResponseFrame, REQUEST_FRAME_LEN};
use crate::utils::errors::InterposeError;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Splits a channel stream into request frames and writes response frames
#[derive(Debug, Default, Clone, Copy)]
pub struct MediatorCodec;

impl MediatorCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MediatorCodec {
    type Item = RequestFrame;
    type Error = InterposeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < REQUEST_FRAME_LEN {
            src.reserve(REQUEST_FRAME_LEN - src.len());
            return Ok(None);
        }
        let frame = src.split_to(REQUEST_FRAME_LEN).freeze();
        RequestFrame::from_bytes(frame).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(InterposeError::TransportError(format!(
                "channel closed with {} bytes of a partial request",
                src.len()
            ))),
        }
    }
}

impl Encoder<ResponseFrame> for MediatorCodec {
    type Error = InterposeError;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}
