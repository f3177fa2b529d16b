//! gzip 阶段：包裹分帧层之下的整条字节流。
//!
//! 出站方向每编码一帧就做一次同步刷新（sync flush），保证对端无需等待后续数据
//! 就能解压出完整帧；入站方向把收到的压缩字节增量解压到明文缓冲，再交给分帧器。

use std::io::{self, Write};

use bytes::BytesMut;
use flate2::{
    Compression,
    write::{GzDecoder, GzEncoder},
};

use crate::error::FramingError;

/// 默认压缩级别，与 zlib 默认值一致。
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

pub(crate) struct GzipDeflater {
    encoder: GzEncoder<Vec<u8>>,
}

impl GzipDeflater {
    pub(crate) fn new(level: u32) -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::new(level)),
        }
    }

    /// 压缩 `input` 并把当前可输出的全部字节追加到 `dst`。
    pub(crate) fn deflate(&mut self, input: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        self.encoder.write_all(input)?;
        self.encoder.flush()?;
        let produced = self.encoder.get_mut();
        dst.extend_from_slice(produced);
        produced.clear();
        Ok(())
    }
}

pub(crate) struct GzipInflater {
    decoder: GzDecoder<Vec<u8>>,
}

impl GzipInflater {
    pub(crate) fn new() -> Self {
        Self {
            decoder: GzDecoder::new(Vec::new()),
        }
    }

    /// 解压 `input`，明文追加到 `plain`。
    pub(crate) fn inflate(&mut self, input: &[u8], plain: &mut BytesMut) -> Result<(), FramingError> {
        self.decoder
            .write_all(input)
            .and_then(|()| self.decoder.flush())
            .map_err(FramingError::Compression)?;
        let produced = self.decoder.get_mut();
        plain.extend_from_slice(produced);
        produced.clear();
        Ok(())
    }
}
