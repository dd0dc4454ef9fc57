use std::convert::TryInto;
use std::env;
use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::commands::Command;
use crate::frame::{self, Frame};
use crate::Error;

pub struct FrameCodec;

impl FrameCodec {
    fn max_frame_size() -> usize {
        env::var("MAX_FRAME_SIZE")
            .map(|s| s.parse().expect("MAX_FRAME_SIZE must be a number"))
            .unwrap_or(512 * 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Reject absurdly large replies before buffering them whole.
        if src.len() > FrameCodec::max_frame_size() {
            return Err(Error::Protocol("frame size exceeds limit".to_string()));
        }

        let mut cursor = Cursor::new(&src[..]);
        let frame = match Frame::parse(&mut cursor) {
            Ok(frame) => frame,
            // Not enough data to parse a frame; keep the bytes and wait for
            // the next transport read.
            Err(frame::Error::Incomplete) => return Ok(None),
            Err(err) => return Err(Error::Protocol(err.to_string())),
        };

        let position: usize = cursor
            .position()
            .try_into()
            .expect("cursor position is too large");

        // Remove the parsed frame from the buffer.
        src.advance(position);

        Ok(Some(frame))
    }
}

impl Encoder<&Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, command: &Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame::encode_command(command));
        Ok(())
    }
}
