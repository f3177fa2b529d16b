//! 入站 / 出站编解码器：把压缩、分帧、信封三个阶段串成 `tokio_util` 的
//! [`Decoder`] 与 [`Encoder`]。
//!
//! 两个方向各持有独立的压缩状态，因此读半部与写半部可以在不同任务中运行。

pub mod compression;
pub mod frame;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::FramingError,
    wire::{self, WirePayload},
};
use compression::{GzipDeflater, GzipInflater};
use frame::VarintFrameCodec;

/// 入站链路：`gzip?` → 分帧 → 信封解码。
pub struct InboundCodec {
    inflater: Option<GzipInflater>,
    plain: BytesMut,
    frames: VarintFrameCodec,
}

impl InboundCodec {
    pub(crate) fn new(compressed: bool, max_frame_length: usize) -> Self {
        Self {
            inflater: compressed.then(GzipInflater::new),
            plain: BytesMut::new(),
            frames: VarintFrameCodec::new(max_frame_length),
        }
    }

    fn pending(&self, src: &BytesMut) -> usize {
        if self.inflater.is_some() {
            self.plain.len()
        } else {
            src.len()
        }
    }
}

impl Decoder for InboundCodec {
    type Item = WirePayload;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = match &mut self.inflater {
            Some(inflater) => {
                if !src.is_empty() {
                    let compressed = src.split();
                    inflater.inflate(&compressed, &mut self.plain)?;
                }
                self.frames.decode_frame(&mut self.plain)?
            }
            None => self.frames.decode_frame(src)?,
        };
        frame
            .map(|frame| wire::decode_payload(frame.freeze()))
            .transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload) = self.decode(src)? {
            return Ok(Some(payload));
        }
        match self.pending(src) {
            0 => Ok(None),
            buffered => Err(FramingError::Truncated { buffered }),
        }
    }
}

/// 出站链路：信封编码 → 分帧 → `gzip?`。
pub struct OutboundCodec {
    deflater: Option<GzipDeflater>,
    frames: VarintFrameCodec,
    scratch: BytesMut,
}

impl OutboundCodec {
    pub(crate) fn new(compression_level: Option<u32>, max_frame_length: usize) -> Self {
        Self {
            deflater: compression_level.map(GzipDeflater::new),
            frames: VarintFrameCodec::new(max_frame_length),
            scratch: BytesMut::new(),
        }
    }
}

impl Encoder<WirePayload> for OutboundCodec {
    type Error = FramingError;

    fn encode(&mut self, item: WirePayload, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.scratch.clear();
        wire::encode_payload(&item, &mut self.scratch);
        let message = self.scratch.split();
        match &mut self.deflater {
            None => self.frames.encode_frame(&message, dst),
            Some(deflater) => {
                self.frames.encode_frame(&message, &mut self.scratch)?;
                let framed = self.scratch.split();
                deflater
                    .deflate(&framed, dst)
                    .map_err(FramingError::Compression)
            }
        }
    }
}
