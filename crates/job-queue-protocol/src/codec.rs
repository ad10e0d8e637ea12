use crate::{Frame, FrameType, ProtocolError, Result, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec for horse pipe frames with length-prefixed framing
///
/// Frame format: [4-byte length (big-endian)] [1-byte frame type] [bincode payload]
#[derive(Debug, Default)]
pub struct HorseCodec;

impl Decoder for HorseCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least 5 bytes for length prefix + frame type
        if src.len() < 5 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }
        if length == 0 {
            return Err(ProtocolError::InvalidFrameType(0));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);

        let frame_type_byte = src.get_u8();
        let frame_type =
            FrameType::from_u8(frame_type_byte).ok_or(ProtocolError::InvalidFrameType(frame_type_byte))?;

        let payload = src.split_to(length - 1);

        let frame = match frame_type {
            FrameType::Request => Frame::Request(bincode::deserialize(&payload)?),
            FrameType::Report => Frame::Report(bincode::deserialize(&payload)?),
        };

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for HorseCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let payload = match &item {
            Frame::Request(req) => bincode::serialize(req)?,
            Frame::Report(report) => bincode::serialize(report)?,
        };

        let total_length = 1 + payload.len();
        if total_length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(total_length));
        }

        dst.reserve(4 + total_length);
        dst.put_u32(total_length as u32);
        dst.put_u8(item.frame_type().as_u8());
        dst.put_slice(&payload);

        Ok(())
    }
}
