//! Base-128 varint 辅助函数，与 protobuf 的编码规则一致。

use bytes::BufMut;

use crate::error::FramingError;

/// varint32 最多占用的字节数。
pub const MAX_VARINT32_WIDTH: usize = 5;
const MAX_VARINT64_WIDTH: usize = 10;

/// 读取长度前缀。
///
/// - 返回 `Ok(None)`：缓冲内的字节不足以确定长度，需要继续读取；
/// - 返回 `Err(MalformedLength)`：第 5 个字节仍带续位，或高位溢出 32 位。
pub fn decode_varint32(buf: &[u8]) -> Result<Option<(u32, usize)>, FramingError> {
    let mut value: u32 = 0;
    for (index, byte) in buf.iter().take(MAX_VARINT32_WIDTH).enumerate() {
        // 第 5 个字节只能携带剩余的 4 位，且不能再有续位。
        if index == MAX_VARINT32_WIDTH - 1 && byte & 0xf0 != 0 {
            return Err(FramingError::MalformedLength);
        }
        value |= u32::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    Ok(None)
}

/// 读取消息内部的 varint 字段；数据不完整视为格式错误。
pub fn decode_varint64(buf: &[u8]) -> Result<(u64, usize), FramingError> {
    let mut value: u64 = 0;
    for (index, byte) in buf.iter().take(MAX_VARINT64_WIDTH).enumerate() {
        if index == MAX_VARINT64_WIDTH - 1 && *byte > 1 {
            return Err(FramingError::MalformedPayload("varint overflows 64 bits"));
        }
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
    }
    Err(FramingError::MalformedPayload("truncated varint"))
}

pub fn put_varint(mut value: u64, dst: &mut impl BufMut) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint32_boundaries() {
        for value in [0u32, 1, 127, 128, 300, 16_383, 16_384, u32::MAX] {
            let mut buf = Vec::new();
            put_varint(u64::from(value), &mut buf);
            assert_eq!(buf.len(), varint_len(u64::from(value)));
            assert_eq!(decode_varint32(&buf).unwrap(), Some((value, buf.len())));
        }
    }

    #[test]
    fn incomplete_prefix_waits_for_more_bytes() {
        assert_eq!(decode_varint32(&[]).unwrap(), None);
        assert_eq!(decode_varint32(&[0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn fifth_byte_continuation_is_malformed() {
        let err = decode_varint32(&[0xff, 0xff, 0xff, 0xff, 0x8f]).unwrap_err();
        assert!(matches!(err, FramingError::MalformedLength));
        let overflow = decode_varint32(&[0xff, 0xff, 0xff, 0xff, 0x1f]).unwrap_err();
        assert!(matches!(overflow, FramingError::MalformedLength));
    }

    #[test]
    fn varint64_requires_terminating_byte() {
        assert!(decode_varint64(&[0x80]).is_err());
        assert_eq!(decode_varint64(&[0xac, 0x02]).unwrap(), (300, 2));
    }
}
