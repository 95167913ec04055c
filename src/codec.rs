use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::trace;

use crate::message::Message;

/// The largest frame accepted, enough for a NODES reply of several hundred contacts.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// A length-delimited codec for routing [`Message`]s.
pub struct MessageCodec {
    codec: LengthDelimitedCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            codec: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = match self.codec.decode(src)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match bincode::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((message, _length)) => Ok(Some(message)),
            Err(e) => {
                trace!(len = bytes.len(), "undecodable frame");
                Err(io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::encode_to_vec(message, bincode::config::standard())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        self.codec.encode(Bytes::from(bytes), dst)
    }
}
