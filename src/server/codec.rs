//! Client Frame Codec
//!
//! Length-prefixed, checksummed bincode frames using the same 8-byte header
//! as node traffic.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::master::{Request, Response};
use crate::network::{protocol, FrameHeader};

/// Decodes `D` frames and encodes `E` frames
pub struct BincodeCodec<D, E> {
    max_body: u32,
    _marker: PhantomData<fn(E) -> D>,
}

/// Server side of a client session
pub type ClientCodec = BincodeCodec<Request, Response>;

impl<D, E> BincodeCodec<D, E> {
    pub fn new() -> Self {
        Self::with_max_body(FrameHeader::MAX_BODY)
    }

    pub fn with_max_body(max_body: u32) -> Self {
        Self {
            max_body,
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for BincodeCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for BincodeCodec<D, E> {
    type Item = D;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let mut header_bytes = [0u8; FrameHeader::SIZE];
        header_bytes.copy_from_slice(&src[..FrameHeader::SIZE]);
        let header = FrameHeader::from_bytes(&header_bytes);

        if header.length > self.max_body {
            return Err(Error::Validation(format!(
                "frame of {} bytes exceeds limit {}",
                header.length, self.max_body
            )));
        }

        let total = FrameHeader::SIZE + header.length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let body = src.split_to(header.length as usize);
        if !header.verify(&body) {
            return Err(Error::Validation("frame checksum mismatch".into()));
        }

        protocol::decode(&body)
            .map(Some)
            .map_err(|e| Error::Validation(format!("malformed request: {}", e)))
    }
}

impl<D, E: Serialize> Encoder<E> for BincodeCodec<D, E> {
    type Error = Error;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<()> {
        let body = protocol::encode(&item)?;
        let header = FrameHeader::new(&body);
        dst.reserve(FrameHeader::SIZE + body.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}
