use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::FramingError,
    wire::varint::{MAX_VARINT32_WIDTH, decode_varint32, put_varint, varint_len},
};

/// 默认最大帧长度：8 MiB。
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// varint32 长度前缀分帧器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - TCP 只保证字节有序，帧边界需要在字节流之上重建；
/// - 长度前缀来自对端，不可信：必须在分配缓冲之前就与上限比较，否则一个伪造的
///   4 GiB 声明就能耗尽内存。
///
/// ## 逻辑 (How)
/// - 先窥视前缀（不消费），不完整时返回 `Ok(None)` 等待更多字节；
/// - 声明长度超过 `max_frame_length` 立即返回 [`FramingError::Oversized`]；
/// - 只为“当前缺口”预留空间，而缺口上限就是 `max_frame_length`。
///
/// ## 契约 (What)
/// - 解码输出完整帧体（不含前缀），部分帧永远不会交给上层；
/// - 编码时同样拒绝超过上限的出站帧。
#[derive(Clone, Copy, Debug)]
pub struct VarintFrameCodec {
    max_frame_length: usize,
}

impl VarintFrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub(crate) fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<BytesMut>, FramingError> {
        let Some((declared, width)) = decode_varint32(src)? else {
            src.reserve(MAX_VARINT32_WIDTH);
            return Ok(None);
        };
        let declared = declared as usize;
        if declared > self.max_frame_length {
            return Err(FramingError::Oversized {
                declared: declared as u64,
                max: self.max_frame_length,
            });
        }
        let total = width + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(width);
        Ok(Some(src.split_to(declared)))
    }

    pub(crate) fn encode_frame(&self, frame: &[u8], dst: &mut BytesMut) -> Result<(), FramingError> {
        if frame.len() > self.max_frame_length {
            return Err(FramingError::Oversized {
                declared: frame.len() as u64,
                max: self.max_frame_length,
            });
        }
        dst.reserve(varint_len(frame.len() as u64) + frame.len());
        put_varint(frame.len() as u64, dst);
        dst.extend_from_slice(frame);
        Ok(())
    }
}

impl Default for VarintFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for VarintFrameCodec {
    type Item = BytesMut;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_frame(src)
    }
}

impl Encoder<Bytes> for VarintFrameCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_frame(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frames_are_held_back() {
        let mut codec = VarintFrameCodec::default();
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"hello frame"), &mut wire)
            .unwrap();

        let mut inbound = BytesMut::new();
        let (head, tail) = wire.split_at(4);
        inbound.extend_from_slice(head);
        assert!(codec.decode(&mut inbound).unwrap().is_none());
        inbound.extend_from_slice(tail);
        let frame = codec.decode(&mut inbound).unwrap().expect("完整帧");
        assert_eq!(&frame[..], b"hello frame");
        assert!(inbound.is_empty());
    }

    #[test]
    fn oversized_declaration_is_rejected_before_allocation() {
        let mut codec = VarintFrameCodec::new(1024);
        let mut inbound = BytesMut::new();
        // 声明 3 GiB 的帧体，只给出前缀。
        put_varint(3 * 1024 * 1024 * 1024, &mut inbound);
        let capacity_before = inbound.capacity();

        let err = codec.decode(&mut inbound).unwrap_err();
        assert!(matches!(
            err,
            FramingError::Oversized { declared, max: 1024 } if declared == 3 * 1024 * 1024 * 1024
        ));
        assert_eq!(inbound.capacity(), capacity_before);
    }

    #[test]
    fn outbound_frames_respect_the_limit() {
        let mut codec = VarintFrameCodec::new(8);
        let mut dst = BytesMut::new();
        assert!(codec.encode(Bytes::from_static(b"12345678"), &mut dst).is_ok());
        assert!(matches!(
            codec.encode(Bytes::from_static(b"123456789"), &mut dst),
            Err(FramingError::Oversized { declared: 9, max: 8 })
        ));
    }

    #[test]
    fn zero_length_frames_are_delivered() {
        let mut codec = VarintFrameCodec::default();
        let mut inbound = BytesMut::from(&[0u8, 1, b'x'][..]);
        assert!(codec.decode(&mut inbound).unwrap().unwrap().is_empty());
        assert_eq!(&codec.decode(&mut inbound).unwrap().unwrap()[..], b"x");
    }
}
